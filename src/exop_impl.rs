use std::str;

use lber::common::TagClass;
use lber::structures::{OctetString, Tag};

/// Generic extended operation.
///
/// The LDAP protocol specifies the form of extended operations, but individual
/// operations, their semantics, and the shape of requests and responses are
/// described in their own specifications. This struct represents the generic
/// form; a specific operation should implement the `From` conversion of itself
/// into an `Exop`, while a specific response should implement the
/// [`ExopParser`](trait.ExopParser.html) trait.
#[derive(Clone, Debug)]
pub struct Exop {
    /// OID of the operation. It may be absent in the response.
    pub name: Option<String>,
    /// Generic operation value. It may be absent in both the request
    /// and the response.
    pub val: Option<Vec<u8>>,
}

/// Conversion trait for extended operation responses.
pub trait ExopParser {
    /// Convert the raw BER value into an exop-specific struct.
    fn parse(val: &[u8]) -> Self;
}

impl Exop {
    /// Parse the generic exop into an operation-specific struct.
    ///
    /// The parser will panic if the value is `None`.
    pub fn parse<T: ExopParser>(&self) -> T {
        T::parse(self.val.as_ref().expect("value"))
    }
}

pub(crate) fn construct_exop(exop: Exop) -> Vec<Tag> {
    assert!(exop.name.is_some() || exop.val.is_some());
    let mut seq = vec![];
    if let Some(name) = exop.name {
        seq.push(Tag::OctetString(OctetString {
            id: 0,
            class: TagClass::Context,
            inner: Vec::from(name.as_bytes()),
        }));
    }
    if let Some(val) = exop.val {
        seq.push(Tag::OctetString(OctetString {
            id: 1,
            class: TagClass::Context,
            inner: val,
        }));
    }
    seq
}

pub const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// StartTLS extended operation ([RFC 4511](https://tools.ietf.org/html/rfc4511#section-4.14)).
///
/// Upgrades an established clear-text connection to TLS in place. The
/// request has no data; a success response means the server is ready for
/// the TLS handshake on the same socket, and nothing else may be sent on
/// the connection until the handshake concludes.
#[derive(Clone, Debug)]
pub struct StartTLS;

impl From<StartTLS> for Exop {
    fn from(_: StartTLS) -> Exop {
        Exop {
            name: Some(STARTTLS_OID.to_owned()),
            val: None,
        }
    }
}

pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

/// Who Am I extended operation ([RFC 4532](https://tools.ietf.org/html/rfc4532)).
///
/// Returns the authorization identity of the connection, as established by
/// the last successful Bind.
#[derive(Clone, Debug)]
pub struct WhoAmI;

/// Who Am I response.
#[derive(Clone, Debug)]
pub struct WhoAmIResp {
    /// The authorization identity, empty for an anonymous connection.
    pub authzid: String,
}

impl From<WhoAmI> for Exop {
    fn from(_: WhoAmI) -> Exop {
        Exop {
            name: Some(WHOAMI_OID.to_owned()),
            val: None,
        }
    }
}

impl ExopParser for WhoAmIResp {
    fn parse(val: &[u8]) -> WhoAmIResp {
        WhoAmIResp {
            authzid: str::from_utf8(val).expect("authzid").to_owned(),
        }
    }
}
