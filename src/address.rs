//! Data types for addresses of nodes in DICOM networks.
//!
//! A network peer is reached through a socket address,
//! but DICOM nodes are also named by an application entity title.
//! The types here combine the two in the `{ae_title}@{address}` syntax
//! commonly found in DICOM tooling.

use std::{
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
};

use snafu::{ResultExt, Snafu};

/// A full address to a target application entity:
/// an AE title plus a socket address.
///
/// Values of this type can be parsed from and displayed in
/// the syntax `{ae_title}@{socket_address}`.
///
/// # Example
///
/// ```
/// # use dicom_dimse::FullAeAddr;
/// # use std::net::SocketAddr;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: FullAeAddr = "STORE-SCP@127.0.0.1:104".parse()?;
/// assert_eq!(addr.ae_title(), "STORE-SCP");
/// assert_eq!(addr.socket_addr(), SocketAddr::from(([127, 0, 0, 1], 104)));
/// assert_eq!(&addr.to_string(), "STORE-SCP@127.0.0.1:104");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FullAeAddr {
    ae_title: String,
    socket_addr: SocketAddr,
}

impl FullAeAddr {
    /// Create an AE address from its constituent parts.
    pub fn new(ae_title: impl Into<String>, socket_addr: SocketAddr) -> Self {
        FullAeAddr {
            ae_title: ae_title.into(),
            socket_addr,
        }
    }

    /// Retrieve the application entity title portion.
    pub fn ae_title(&self) -> &str {
        &self.ae_title
    }

    /// Retrieve the socket address portion.
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }
}

impl From<(String, SocketAddr)> for FullAeAddr {
    fn from((ae_title, socket_addr): (String, SocketAddr)) -> Self {
        Self::new(ae_title, socket_addr)
    }
}

/// An error parsing an AE address.
#[derive(Debug, Clone, Eq, PartialEq, Snafu)]
pub enum ParseAeAddressError {
    /// Missing `@` in full AE address
    MissingPart,

    /// Could not parse socket address
    ParseSocketAddress {
        source: std::net::AddrParseError,
    },
}

impl FromStr for FullAeAddr {
    type Err = ParseAeAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ae_title, addr) = s.split_once('@').ok_or(ParseAeAddressError::MissingPart)?;
        Ok(FullAeAddr {
            ae_title: ae_title.to_string(),
            socket_addr: addr.parse().context(ParseSocketAddressSnafu)?,
        })
    }
}

impl ToSocketAddrs for FullAeAddr {
    type Iter = std::option::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        self.socket_addr.to_socket_addrs()
    }
}

impl std::fmt::Display for FullAeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.ae_title, self.socket_addr)
    }
}

/// An address to a DICOM node in which the AE title is optional,
/// and the network half may be a host name yet to be resolved.
///
/// This is the type to use when taking peer addresses as user input:
/// both `PACS@pacs.example.com:104` and `192.168.1.99:1045` parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AeAddr {
    ae_title: Option<String>,
    address: String,
}

impl AeAddr {
    /// Create an address with an explicit AE title.
    pub fn new(ae_title: impl Into<String>, address: impl Into<String>) -> Self {
        AeAddr {
            ae_title: Some(ae_title.into()),
            address: address.into(),
        }
    }

    /// Retrieve the application entity title, if present.
    pub fn ae_title(&self) -> Option<&str> {
        self.ae_title.as_deref()
    }

    /// Retrieve the network address portion.
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl FromStr for AeAddr {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((ae_title, address)) if !ae_title.is_empty() => Ok(AeAddr {
                ae_title: Some(ae_title.to_string()),
                address: address.to_string(),
            }),
            Some((_, address)) => Ok(AeAddr {
                ae_title: None,
                address: address.to_string(),
            }),
            None => Ok(AeAddr {
                ae_title: None,
                address: s.to_string(),
            }),
        }
    }
}

impl ToSocketAddrs for AeAddr {
    type Iter = std::vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        self.address.to_socket_addrs()
    }
}

impl std::fmt::Display for AeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ae_title) = &self.ae_title {
            write!(f, "{}@", ae_title)?;
        }
        f.write_str(&self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_ae_addr_roundtrip() {
        let addr: FullAeAddr = "MAIN-STORAGE@10.0.0.2:104".parse().unwrap();
        assert_eq!(addr.ae_title(), "MAIN-STORAGE");
        assert_eq!(addr.socket_addr().port(), 104);
        assert_eq!(addr.to_string(), "MAIN-STORAGE@10.0.0.2:104");
    }

    #[test]
    fn full_ae_addr_requires_both_parts() {
        assert_eq!(
            "127.0.0.1:104".parse::<FullAeAddr>(),
            Err(ParseAeAddressError::MissingPart)
        );
    }

    #[test]
    fn ae_addr_title_is_optional() {
        let addr: AeAddr = "pacs.example.com:104".parse().unwrap();
        assert_eq!(addr.ae_title(), None);
        assert_eq!(addr.address(), "pacs.example.com:104");

        let addr: AeAddr = "PACS@pacs.example.com:104".parse().unwrap();
        assert_eq!(addr.ae_title(), Some("PACS"));
        assert_eq!(addr.to_string(), "PACS@pacs.example.com:104");
    }
}
