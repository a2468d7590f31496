//! IP-to-location resolution over IP2Location DB5-lite ranges.
use std::net::{IpAddr, Ipv4Addr};
use std::{fs::File, io::Read, path::Path};

use bincode::{Decode, Encode};
use serde::Deserialize;
use tracing::debug;

use crate::NearbyError;

/// One row of the IP2Location DB5-lite CSV.
///
/// The file has no header; columns are
/// `ip_from,ip_to,country_code,country_name,region_name,city_name,latitude,longitude`.
#[derive(Clone, PartialEq, Debug, Encode, Decode, Deserialize)]
pub struct IpRange {
    pub start_ip: u32,
    pub end_ip: u32,
    pub iso2: String,
    pub country: String,
    pub region: String,
    pub city: String,
    pub lat: f64,
    pub lng: f64,
}

impl IpRange {
    /// Ranges IP2Location could not attribute carry `-` as the country code.
    pub fn is_known(&self) -> bool {
        self.iso2 != "-" && !self.iso2.is_empty()
    }
}

/// Finds the range containing an address given as a big-endian integer.
pub trait IpLocator {
    fn locate(&self, ip: u32) -> Result<Option<IpRange>, NearbyError>;
}

/// Parses an IPv4 address, accepting IPv4-mapped IPv6 addresses.
pub fn parse_ipv4(ip: &str) -> Result<Ipv4Addr, NearbyError> {
    match ip.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => Ok(v4),
        Ok(IpAddr::V6(v6)) => v6
            .to_ipv4_mapped()
            .ok_or_else(|| NearbyError::InvalidIp(format!("not an IPv4 address: {}", ip))),
        Err(_) => Err(NearbyError::InvalidIp(ip.to_string())),
    }
}

/// True for addresses that must never be geolocated: the private ranges
/// 10.0.0.0/8, 172.16.0.0/12 and 192.168.0.0/16, plus loopback, link-local,
/// broadcast and unspecified addresses.
pub fn is_private_or_reserved(ip: Ipv4Addr) -> bool {
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_unspecified()
}

/// `(b0 << 24) | (b1 << 16) | (b2 << 8) | b3`
pub fn ip_to_integer(ip: Ipv4Addr) -> u32 {
    u32::from_be_bytes(ip.octets())
}

/// Resolves an address to its IP2Location range.
///
/// Private and reserved addresses resolve to `None` without consulting the
/// locator, as do ranges with an unknown country.
///
/// # Errors
///
/// Returns `NearbyError::InvalidIp` when `ip` is not an IPv4 address.
pub fn resolve_ip(locator: &dyn IpLocator, ip: &str) -> Result<Option<IpRange>, NearbyError> {
    let addr = parse_ipv4(ip)?;
    if is_private_or_reserved(addr) {
        debug!("skipping lookup of private address {}", addr);
        return Ok(None);
    }
    let range = locator.locate(ip_to_integer(addr))?;
    Ok(range.filter(IpRange::is_known))
}

pub fn read_ip_ranges<R: Read>(reader: R) -> Result<Vec<IpRange>, NearbyError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(reader);
    let mut ranges = vec![];
    for result in rdr.deserialize() {
        let range: IpRange = result?;
        ranges.push(range);
    }
    Ok(ranges)
}

pub fn load_ip_ranges(path: &Path) -> Result<Vec<IpRange>, NearbyError> {
    read_ip_ranges(File::open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingLocator {
        calls: Cell<usize>,
        ranges: Vec<IpRange>,
    }

    impl IpLocator for CountingLocator {
        fn locate(&self, ip: u32) -> Result<Option<IpRange>, NearbyError> {
            self.calls.set(self.calls.get() + 1);
            Ok(self
                .ranges
                .iter()
                .find(|r| r.start_ip <= ip && ip <= r.end_ip)
                .cloned())
        }
    }

    const DB5: &str = "\"0\",\"16777215\",\"-\",\"-\",\"-\",\"-\",\"0.000000\",\"0.000000\"\n\
\"16777216\",\"16777471\",\"US\",\"United States of America\",\"California\",\"Los Angeles\",\"34.052230\",\"-118.243680\"\n\
\"1902835712\",\"1902837759\",\"VN\",\"Viet Nam\",\"Ha Noi\",\"Hanoi\",\"21.024500\",\"105.841170\"\n";

    fn locator() -> CountingLocator {
        CountingLocator {
            calls: Cell::new(0),
            ranges: read_ip_ranges(DB5.as_bytes()).unwrap(),
        }
    }

    #[test]
    fn test_ip_to_integer() {
        assert_eq!(ip_to_integer(Ipv4Addr::new(1, 0, 0, 0)), 16777216);
        assert_eq!(ip_to_integer(Ipv4Addr::new(113, 106, 0, 1)), 1902772225);
        assert_eq!(ip_to_integer(Ipv4Addr::new(255, 255, 255, 255)), u32::MAX);
    }

    #[test]
    fn test_parse_ipv4() {
        assert_eq!(parse_ipv4("8.8.8.8").unwrap(), Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(
            parse_ipv4("::ffff:1.2.3.4").unwrap(),
            Ipv4Addr::new(1, 2, 3, 4)
        );
        assert!(matches!(parse_ipv4("2001:db8::1"), Err(NearbyError::InvalidIp(_))));
        assert!(matches!(parse_ipv4("not.an.ip"), Err(NearbyError::InvalidIp(_))));
        assert!(matches!(parse_ipv4(""), Err(NearbyError::InvalidIp(_))));
    }

    #[test]
    fn test_private_ranges() {
        for ip in ["10.0.0.1", "172.16.0.1", "172.31.255.255", "192.168.1.1", "127.0.0.1"] {
            assert!(is_private_or_reserved(parse_ipv4(ip).unwrap()), "{}", ip);
        }
        for ip in ["172.32.0.1", "8.8.8.8", "113.161.0.1"] {
            assert!(!is_private_or_reserved(parse_ipv4(ip).unwrap()), "{}", ip);
        }
    }

    #[test]
    fn test_private_address_is_never_looked_up() {
        let locator = locator();
        assert!(resolve_ip(&locator, "192.168.1.1").unwrap().is_none());
        assert_eq!(locator.calls.get(), 0);
    }

    #[test]
    fn test_resolve_ip() {
        let locator = locator();
        let range = resolve_ip(&locator, "113.106.0.1").unwrap();
        assert!(range.is_none());

        let hanoi = resolve_ip(&locator, "113.106.250.10").unwrap().unwrap();
        assert_eq!(hanoi.city, "Hanoi");
        assert_eq!(hanoi.iso2, "VN");

        // unknown country
        assert!(resolve_ip(&locator, "0.0.0.1").unwrap().is_none());
        assert_eq!(locator.calls.get(), 3);
    }
}
