//! A multiplexing LDAP client for the Tokio stack.
//!
//! ## Summary
//!
//! The library drives any number of concurrent LDAPv3 operations over a
//! single server connection, correlating responses to their issuers by
//! message ID. The connection itself is managed for the caller: server
//! URLs are tried in round-robin order, lost connections are reestablished
//! with exponential backoff, requests submitted while the connection is
//! down wait in a FIFO queue, and connection setup can transparently run
//! StartTLS and a simple bind before the first queued request is sent.
//!
//! The library provides both synchronous and asynchronous interfaces. The
//! [`LdapConn`](struct.LdapConn.html) structure is the starting point for all synchronous
//! operations. [`LdapConnection`](struct.LdapConnection.html) with its cloneable
//! [`Ldap`](struct.Ldap.html) handle is the asynchronous analogue.
//!
//! The documentation is written for readers familiar with LDAP concepts and terminology,
//! which it won't attempt to explain.
//!
//! ## Compile-time features
//!
//! The following features are available at compile time:
//!
//! * __sync__ (enabled by default): Synchronous API support.
//!
//! * __tls__ (enabled by default): TLS support, backed by the `native-tls`
//!   crate, which uses a platform-specific TLS backend. Enables the
//!   __ldaps__ scheme and the StartTLS setup step.
//!
//! Without any features, only plain TCP connections (and Unix domain sockets on Unix-like
//! platforms) are available.
//!
//! ## Examples
//!
//! The following two examples perform exactly the same operation and should produce identical
//! results. They should be run against a server accepting anonymous search.
//!
//! ### Synchronous search
//!
//! ```rust,no_run
//! use ldapmux::{LdapConn, Scope, SearchEntry, SearchOptions};
//! use ldapmux::result::Result;
//!
//! fn main() -> Result<()> {
//!     let mut ldap = LdapConn::new("ldap://localhost:2389")?;
//!     let (rs, _res) = ldap.search(
//!         "ou=Places,dc=example,dc=org",
//!         SearchOptions::new()
//!             .scope(Scope::Subtree)
//!             .filter("(&(objectClass=locality)(l=ma*))")
//!             .attrs(["l"]),
//!     )?.success()?;
//!     for entry in rs {
//!         println!("{:?}", SearchEntry::construct(entry));
//!     }
//!     Ok(ldap.unbind()?)
//! }
//! ```
//!
//! ### Asynchronous search
//!
//! ```rust,no_run
//! use ldapmux::{LdapConnection, Scope, SearchEntry, SearchOptions};
//! use ldapmux::result::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (conn, mut ldap) = LdapConnection::new("ldap://localhost:2389")?;
//!     ldapmux::drive!(conn);
//!     let (rs, _res) = ldap.search(
//!         "ou=Places,dc=example,dc=org",
//!         SearchOptions::new()
//!             .scope(Scope::Subtree)
//!             .filter("(&(objectClass=locality)(l=ma*))")
//!             .attrs(["l"]),
//!     ).await?.success()?;
//!     for entry in rs {
//!         println!("{:?}", SearchEntry::construct(entry));
//!     }
//!     Ok(ldap.unbind().await?)
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

#[doc(hidden)]
pub use log;
#[doc(hidden)]
pub use tokio;

/// Type alias for the LDAP message ID.
pub type RequestId = i32;

pub mod asn1 {
    //! Re-exports of the BER building blocks from the `lber` crate.
    //!
    //! Custom controls and extended operations are built out of these;
    //! the shipped `PagedResults` control and `StartTLS`/`WhoAmI` exops
    //! double as worked examples of the interface.
    pub use lber::common::TagClass;
    pub use lber::parse::{parse_tag, parse_uint, Parser};
    pub use lber::structure::{StructureTag, PL};
    pub use lber::structures::{
        ASNTag, Boolean, Enumerated, ExplicitTag, Integer, Null, OctetString, Sequence, Set, Tag,
    };
    pub use lber::universal::Types;
    pub use lber::write;
    pub use lber::IResult;
}
mod conn;
pub mod controls {
    //! Request and response controls.
    //!
    //! On the request side, anything convertible into a
    //! [`RawControl`](struct.RawControl.html) can be attached to an
    //! operation through [`with_controls()`](../struct.Ldap.html#method.with_controls);
    //! the [`PagedResults`](struct.PagedResults.html) control shipped here
    //! is what the paged Search rides on. A control type defined outside
    //! this crate only needs the `Into<RawControl>` conversion, plus the
    //! [`ControlParser`](trait.ControlParser.html) trait if its response
    //! value should be decodable with
    //! [`RawControl::parse()`](struct.RawControl.html#method.parse).
    //!
    //! On the response side, each control arrives as a
    //! [`Control`](struct.Control.html): the raw OID/criticality/value
    //! triple, tagged with a [`ControlType`](enum.ControlType.html) when
    //! the OID is one the crate decodes natively. The `ControlType` list
    //! grows over time, so it can't be matched exhaustively.
    pub use crate::controls_impl::PagedResults;
    pub use crate::controls_impl::{
        Control, ControlParser, ControlType, CriticalControl, IntoControlList, MakeCritical,
        RawControl,
    };
}
mod controls_impl;
mod exop_impl;
pub mod exop {
    //! Extended operations.
    //!
    //! [`Exop`](struct.Exop.html) is the protocol-level form: an OID plus
    //! an opaque value. Concrete operations convert themselves into it
    //! with `From`, and give their response a struct implementing
    //! [`ExopParser`](trait.ExopParser.html) when it carries data worth
    //! decoding; by convention such a struct takes the request struct's
    //! name with a `Resp` suffix. Operations defined outside this crate
    //! plug in through exactly the same two traits.
    pub use crate::exop_impl::{Exop, ExopParser, StartTLS, WhoAmI, WhoAmIResp};
}
mod filter;
mod ldap;
mod protocol;
mod queue;
pub mod result;
mod search;
#[cfg(feature = "sync")]
mod sync;
mod tracker;
mod util;

pub use conn::{
    ConnEvent, LdapConnSettings, LdapConnection, ReconnectOptions, ServerEndpoint,
};
pub use filter::parse as parse_filter;
pub use ldap::{Ldap, Mod};
pub use result::{LdapError, LdapResult, SearchResult};
pub use search::parse_refs;
pub use search::{
    DerefAliases, ResultEntry, Scope, SearchEntry, SearchOptions, SearchStream, StreamState,
};
#[cfg(feature = "sync")]
pub use sync::{EntryStream, LdapConn};
pub use util::{dn_escape, ldap_escape};

/// Drive the connection until its completion.
///
/// For the connection `conn`, the macro does the equivalent of:
///
/// ```rust,no_run
/// # use ldapmux::LdapConnection;
/// # use log::warn;
/// # #[tokio::main]
/// # async fn main() {
/// # let (conn, _ldap) = LdapConnection::new("ldap://localhost:2389").unwrap();
/// tokio::spawn(async move {
///     if let Err(e) = conn.drive().await {
///         warn!("LDAP connection error: {}", e);
///     }
/// });
/// # }
/// ```
///
/// If you need custom connection lifecycle handling, use the
/// [`drive()`](struct.LdapConnection.html#method.drive) method on the
/// connection inside your own `async` block.
#[macro_export]
macro_rules! drive {
    ($conn:expr) => {
        $crate::tokio::spawn(async move {
            if let Err(e) = $conn.drive().await {
                $crate::log::warn!("LDAP connection error: {}", e);
            }
        });
    };
}
