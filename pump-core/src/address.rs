use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::io::{Error, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

const V4_RAW_LEN: usize = 6;
const V6_RAW_LEN: usize = 18;

/// An IP endpoint.
///
/// The raw form is the address octets followed by the port in network order,
/// so a v4 endpoint is 6 bytes and a v6 endpoint 18 bytes. Ordering compares the
/// raw length first and then the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    addr: SocketAddr,
    ip: String,
}

impl Address {
    /// Build from a textual ip and a port.
    ///
    /// # Errors
    /// if `ip` is not a valid v4 or v6 address.
    pub fn new(ip: &str, port: u16) -> std::io::Result<Self> {
        let ip = IpAddr::from_str(ip)
            .map_err(|e| Error::new(ErrorKind::InvalidInput, format!("{ip}: {e}")))?;
        Ok(Self::from(SocketAddr::new(ip, port)))
    }

    /// Build from the raw form.
    ///
    /// # Errors
    /// if the slice is neither 6 nor 18 bytes long.
    pub fn from_bytes(raw: &[u8]) -> std::io::Result<Self> {
        let ip = match raw.len() {
            V4_RAW_LEN => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&raw[..4]);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            V6_RAW_LEN => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&raw[..16]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            len => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("raw address must be {V4_RAW_LEN} or {V6_RAW_LEN} bytes, got {len}"),
                ))
            }
        };
        let port = u16::from_be_bytes([raw[raw.len() - 2], raw[raw.len() - 1]]);
        Ok(Self::from(SocketAddr::new(ip, port)))
    }

    /// Replace ip and port.
    ///
    /// # Errors
    /// if `ip` is not a valid address, `self` is left untouched.
    pub fn set(&mut self, ip: &str, port: u16) -> std::io::Result<()> {
        *self = Self::new(ip, port)?;
        Ok(())
    }

    /// The raw form, see the type docs.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = match self.addr.ip() {
            IpAddr::V4(ip) => {
                let mut raw = Vec::with_capacity(V4_RAW_LEN);
                raw.extend_from_slice(&ip.octets());
                raw
            }
            IpAddr::V6(ip) => {
                let mut raw = Vec::with_capacity(V6_RAW_LEN);
                raw.extend_from_slice(&ip.octets());
                raw
            }
        };
        raw.extend_from_slice(&self.addr.port().to_be_bytes());
        raw
    }

    #[must_use]
    pub fn is_v6(&self) -> bool {
        self.addr.is_ipv6()
    }

    #[must_use]
    pub fn ip(&self) -> &str {
        &self.ip
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address {
            ip: addr.ip().to_string(),
            addr,
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SocketAddr::from_str(s)
            .map(Self::from)
            .map_err(|e| Error::new(ErrorKind::InvalidInput, format!("{s}: {e}")))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_v6() {
            write!(f, "[{}]:{}", self.ip, self.port())
        } else {
            write!(f, "{}:{}", self.ip, self.port())
        }
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        let (l, r) = (self.to_bytes(), other.to_bytes());
        l.len().cmp(&r.len()).then_with(|| l.cmp(&r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() -> std::io::Result<()> {
        let v4: Address = "127.0.0.1:8080".parse()?;
        assert_eq!(v4.ip(), "127.0.0.1");
        assert_eq!(v4.port(), 8080);
        assert!(!v4.is_v6());
        assert_eq!(v4.to_string(), "127.0.0.1:8080");

        let v6 = Address::new("::1", 443)?;
        assert!(v6.is_v6());
        assert_eq!(v6.to_string(), "[::1]:443");
        assert!("not an address".parse::<Address>().is_err());
        Ok(())
    }

    #[test]
    fn raw_bytes() -> std::io::Result<()> {
        let v4 = Address::new("10.0.0.2", 0x1234)?;
        let raw = v4.to_bytes();
        assert_eq!(raw, vec![10, 0, 0, 2, 0x12, 0x34]);
        assert_eq!(Address::from_bytes(&raw)?, v4);

        let v6 = Address::new("fe80::1", 53)?;
        assert_eq!(v6.to_bytes().len(), V6_RAW_LEN);
        assert!(Address::from_bytes(&[1, 2, 3]).is_err());
        Ok(())
    }

    #[test]
    fn ordering_and_set() -> std::io::Result<()> {
        let a = Address::new("10.0.0.1", 80)?;
        let b = Address::new("10.0.0.2", 80)?;
        let c = Address::new("::1", 1)?;
        assert!(a < b);
        assert!(b < c);

        let mut d = a.clone();
        assert!(d.set("bogus", 1).is_err());
        assert_eq!(d, a);
        d.set("10.0.0.2", 80)?;
        assert_eq!(d, b);
        Ok(())
    }
}
