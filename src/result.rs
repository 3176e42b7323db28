//! Results of LDAP operations, and the crate's error type.
//!
//! Whatever the operation, the server answers with the same set of result
//! components: a numeric code, the matched DN, diagnostic text, and
//! optional referrals. [`LdapResult`](struct.LdapResult.html) carries them
//! verbatim, numeric code included, because some callers need to branch on
//! non-zero codes that aren't failures for them. Callers that don't can
//! collapse a result into a `Result` with [`success()`](struct.LdapResult.html#method.success)
//! or [`non_error()`](struct.LdapResult.html#method.non_error). A few
//! operations return more than the bare result; those get thin wrapper
//! types with the same pair of helpers.

use std::error::Error;
use std::fmt;
use std::io;
use std::result::Result as StdResult;

use crate::controls::Control;
use crate::exop::Exop;
use crate::search::parse_refs;
use crate::search::ResultEntry;

use lber::common::TagClass;
use lber::parse::parse_uint;
use lber::structure::StructureTag;
use lber::structures::Tag;
use lber::universal::Types;

use thiserror::Error;
use tokio::time;

/// Type alias for the standard `Result` with the fixed `LdapError` error part.
pub type Result<T> = std::result::Result<T, LdapError>;

/// Error variants recognized by the library.
#[derive(Debug, Error)]
pub enum LdapError {
    /// No path given for a `ldapi://` URL.
    #[error("ldapi URL names no socket path")]
    EmptyUnixPath,

    /// A `ldapi://` URL carries a port, which makes no sense for a
    /// Unix domain socket.
    #[error("ldapi URLs cannot carry a port")]
    PortInUnixPath,

    /// The client was created with no server URLs at all.
    #[error("no server URLs given")]
    EmptyUrlList,

    /// Encapsulated I/O error.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Operation or connection timeout.
    #[error("timeout: {elapsed}")]
    Timeout {
        #[from]
        elapsed: time::error::Elapsed,
    },

    /// The connection has been closed or destroyed, and the request can no
    /// longer be satisfied.
    #[error("connection closed")]
    ConnectionClosed,

    /// Connecting to the server did not finish within the configured limit.
    #[error("connect timeout")]
    ConnectTimeout,

    /// The request queue is frozen or full, so the request was refused
    /// instead of being held until the connection recovers.
    #[error("request queue unavailable")]
    QueueUnavailable,

    /// The reconnection budget was spent without reaching any server.
    #[error("reconnect attempts exhausted: {source}")]
    ReconnectExhausted { source: Box<LdapError> },

    /// A response decoded as a frame, but its result components don't
    /// have the shape RFC 4511 gives them.
    #[error("malformed result structure: missing or invalid {0}")]
    MalformedResult(&'static str),

    /// The server answered a paged search without a PagedResults control.
    #[error("paged search not supported by the server")]
    PagedResultsNotSupported,

    /// A DN failed the strict-DN shape check.
    #[error("invalid DN: {0}")]
    InvalidDN(String),

    /// A search filter string didn't parse.
    #[error("unparseable search filter")]
    FilterParsing,

    /// A search stream lost its feed before the final result arrived.
    #[error("search stream cut off before its result")]
    EndOfStream,

    /// A server URL didn't parse.
    #[error("bad server URL: {source}")]
    UrlParsing {
        #[from]
        source: url::ParseError,
    },

    /// A server URL uses a scheme this build doesn't recognize.
    #[error("unrecognized LDAP URL scheme: {0}")]
    UnknownScheme(String),

    #[cfg(feature = "tls")]
    /// Error reported by the TLS stack.
    #[error("TLS error: {source}")]
    NativeTLS {
        #[from]
        source: native_tls::Error,
    },

    /// An operation's result code fell outside the codes it expects.
    #[error("operation failed: {result}")]
    LdapResult {
        #[from]
        result: LdapResult,
    },

    /// An Add carried an attribute with no values.
    #[error("attribute with no values in Add")]
    AddNoValues,
}

impl From<LdapError> for io::Error {
    fn from(le: LdapError) -> io::Error {
        match le {
            LdapError::Io { source, .. } => source,
            _ => io::Error::new(io::ErrorKind::Other, format!("{}", le)),
        }
    }
}

/// The result components common to every LDAP operation.
///
/// The numeric result code is kept as the server sent it. Zero means
/// success, but several other codes are ordinary outcomes rather than
/// errors (compareTrue/compareFalse, referral), which is why the struct
/// doesn't judge the code on its own. When plain success checking is all
/// that's wanted, [`success()`](#method.success) and
/// [`non_error()`](#method.non_error) turn an instance into a `Result`.
#[derive(Clone, Debug)]
pub struct LdapResult {
    /// Result code, per [Appendix A.1 of RFC 4511](https://tools.ietf.org/html/rfc4511#appendix-A.1).
    pub rc: u32,
    /// Matched component DN, where applicable.
    pub matched: String,
    /// Additional diagnostic text.
    pub text: String,
    /// Referrals; empty when the server sent none.
    pub refs: Vec<String>,
    /// Response controls; empty when the server sent none.
    pub ctrls: Vec<Control>,
}

impl Error for LdapResult {}

impl fmt::Display for LdapResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> StdResult<(), fmt::Error> {
        write!(
            f,
            "rc={} ({}), matched: \"{}\", text: \"{}\"",
            self.rc,
            self.description(),
            self.matched,
            self.text
        )
    }
}

impl LdapResult {
    /// Produce a result carrying the given code and diagnostic text, with
    /// all other components empty. Used where the library must synthesise
    /// a result locally, chiefly when tearing down a connection.
    pub(crate) fn synthetic(rc: u32, text: &str) -> LdapResult {
        LdapResult {
            rc,
            matched: String::from(""),
            text: String::from(text),
            refs: vec![],
            ctrls: vec![],
        }
    }

    /// Keep the result if its code is in the accepted set, otherwise turn
    /// it into the error it represents.
    fn accept(self, ok: &[u32]) -> Result<Self> {
        if ok.contains(&self.rc) {
            Ok(self)
        } else {
            Err(self.into())
        }
    }

    /// The protocol name of the result code.
    pub fn description(&self) -> &'static str {
        match self.rc {
            0 => "success",
            1 => "operationsError",
            2 => "protocolError",
            3 => "timeLimitExceeded",
            4 => "sizeLimitExceeded",
            5 => "compareFalse",
            6 => "compareTrue",
            7 => "authMethodNotSupported",
            8 => "strongerAuthRequired",
            10 => "referral",
            11 => "adminLimitExceeded",
            12 => "unavailableCriticalExtension",
            13 => "confidentialityRequired",
            14 => "saslBindInProgress",
            16 => "noSuchAttribute",
            17 => "undefinedAttributeType",
            18 => "inappropriateMatching",
            19 => "constraintViolation",
            20 => "attributeOrValueExists",
            21 => "invalidAttributeSyntax",
            32 => "noSuchObject",
            33 => "aliasProblem",
            34 => "invalidDNSyntax",
            36 => "aliasDereferencingProblem",
            48 => "inappropriateAuthentication",
            49 => "invalidCredentials",
            50 => "insufficientAccessRights",
            51 => "busy",
            52 => "unavailable",
            53 => "unwillingToPerform",
            54 => "loopDetect",
            64 => "namingViolation",
            65 => "objectClassViolation",
            66 => "notAllowedOnNonLeaf",
            67 => "notAllowedOnRDN",
            68 => "entryAlreadyExists",
            69 => "objectClassModsProhibited",
            71 => "affectsMultipleDSAs",
            80 => "other",
            88 => "abandoned",
            122 => "assertionFailed",
            _ => "unknown",
        }
    }

    /// `Ok(self)` for result code zero, the error form of the result for
    /// anything else.
    pub fn success(self) -> Result<Self> {
        self.accept(&[0])
    }

    /// Like [`success()`](#method.success), but referrals (code 10) also
    /// pass.
    pub fn non_error(self) -> Result<Self> {
        self.accept(&[0, 10])
    }
}

/// A fully decoded response: the common result components plus the
/// extended-operation payload, when the response carried one.
#[derive(Clone, Debug)]
pub(crate) struct ParsedResult {
    pub result: LdapResult,
    pub exop: Exop,
}

fn utf8_component(comp: Option<StructureTag>, what: &'static str) -> Result<String> {
    comp.and_then(|t| t.expect_primitive())
        .and_then(|v| String::from_utf8(v).ok())
        .ok_or(LdapError::MalformedResult(what))
}

impl ParsedResult {
    /// Pick apart a response protocol op. Shape violations come back as
    /// [`LdapError::MalformedResult`] instead of taking the connection
    /// down; a `Null` tag stands for a response the library synthesised
    /// itself and parses as a bare success.
    pub(crate) fn parse(tag: Tag) -> Result<ParsedResult> {
        let op = match tag {
            Tag::StructureTag(op) => op,
            Tag::Null(_) => {
                return Ok(ParsedResult {
                    result: LdapResult::synthetic(0, ""),
                    exop: Exop {
                        name: None,
                        val: None,
                    },
                })
            }
            _ => return Err(LdapError::MalformedResult("protocol op")),
        };
        let mut comps = op
            .expect_constructed()
            .ok_or(LdapError::MalformedResult("result components"))?
            .into_iter();
        let rc_bytes = comps
            .next()
            .and_then(|t| t.match_class(TagClass::Universal))
            .and_then(|t| t.match_id(Types::Enumerated as u64))
            .and_then(|t| t.expect_primitive())
            .ok_or(LdapError::MalformedResult("result code"))?;
        let rc = match parse_uint(&rc_bytes) {
            Ok((_, rc)) => rc as u32,
            Err(_) => return Err(LdapError::MalformedResult("result code")),
        };
        let matched = utf8_component(comps.next(), "matched dn")?;
        let text = utf8_component(comps.next(), "diagnostic message")?;
        let mut refs = vec![];
        let mut exop = Exop {
            name: None,
            val: None,
        };
        // what follows the standard triple depends on the operation:
        // referrals for any result, name/value for extended responses
        for comp in comps {
            match comp.id {
                3 => refs.extend(parse_refs(comp)),
                10 => {
                    exop.name = comp
                        .expect_primitive()
                        .and_then(|v| String::from_utf8(v).ok())
                }
                11 => exop.val = comp.expect_primitive(),
                _ => (),
            }
        }
        Ok(ParsedResult {
            result: LdapResult {
                rc,
                matched,
                text,
                refs,
                ctrls: vec![],
            },
            exop,
        })
    }
}

/// Entries and overall result of a Search that was collected in one go.
///
/// [`success()`](#method.success) and [`non_error()`](#method.non_error)
/// unpack the wrapper into an `(entries, result)` tuple while applying the
/// corresponding result-code check.
#[derive(Clone, Debug)]
pub struct SearchResult(pub Vec<ResultEntry>, pub LdapResult);

impl SearchResult {
    /// Unpack the wrapper if the result code is zero; the error form of
    /// the result otherwise.
    pub fn success(self) -> Result<(Vec<ResultEntry>, LdapResult)> {
        let SearchResult(entries, res) = self;
        Ok((entries, res.success()?))
    }

    /// Like [`success()`](#method.success), but referrals (code 10) also
    /// pass.
    pub fn non_error(self) -> Result<(Vec<ResultEntry>, LdapResult)> {
        let SearchResult(entries, res) = self;
        Ok((entries, res.non_error()?))
    }
}

/// Result of a Compare operation.
///
/// Compare is the one operation whose interesting outcomes are two
/// non-zero codes: 6 for a matching value, 5 for a non-matching one.
/// [`equal()`](#method.equal) maps those onto a boolean and treats
/// everything else, referrals included, as an error.
#[derive(Clone, Debug)]
pub struct CompareResult(pub LdapResult);

impl CompareResult {
    /// `true` for compareTrue, `false` for compareFalse, the error form
    /// of the result for any other code.
    pub fn equal(self) -> Result<bool> {
        match self.0.rc {
            5 => Ok(false),
            6 => Ok(true),
            _ => Err(self.0.into()),
        }
    }

    /// The inner result, if its code is compareFalse, compareTrue, or
    /// referral; the error form otherwise.
    pub fn non_error(self) -> Result<LdapResult> {
        self.0.accept(&[5, 6, 10])
    }
}

/// Payload and result of an Extended operation.
///
/// Unpacks like [`SearchResult`](struct.SearchResult.html): the helpers
/// return an `(exop, result)` tuple after checking the result code.
#[derive(Clone, Debug)]
pub struct ExopResult(pub Exop, pub LdapResult);

impl ExopResult {
    /// Unpack the wrapper if the result code is zero; the error form of
    /// the result otherwise.
    pub fn success(self) -> Result<(Exop, LdapResult)> {
        let ExopResult(exop, res) = self;
        Ok((exop, res.success()?))
    }

    /// Like [`success()`](#method.success), but referrals (code 10) also
    /// pass.
    pub fn non_error(self) -> Result<(Exop, LdapResult)> {
        let ExopResult(exop, res) = self;
        Ok((exop, res.non_error()?))
    }
}
