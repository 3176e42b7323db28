//! A scripted LDAP server for lifecycle tests.
//!
//! The server speaks just enough BER-framed LDAP to answer the client:
//! canned result codes for single operations, a fixed entry set for
//! searches, optional PagedResults chunking, and an optional delay for
//! timeout tests. Every connection gets the same script; counters record
//! what the server actually saw.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::time;

use ldapmux::asn1::{
    parse_tag, parse_uint, write, ASNTag, Enumerated, Integer, OctetString, Parser, Sequence, Set,
    StructureTag, Tag, TagClass, PL,
};

pub const PAGED_OID: &str = "1.2.840.113556.1.4.319";

/// What the server should answer.
#[derive(Clone)]
pub struct ServerProfile {
    /// DNs of the entries every search returns.
    pub entries: Vec<String>,
    /// Honor a PagedResults request control by chunking `entries`.
    pub paged: bool,
    /// Result code for BindResponse.
    pub bind_rc: u32,
    /// Result code for CompareResponse.
    pub compare_rc: u32,
    /// Sleep this long before answering any operation.
    pub response_delay: Option<Duration>,
}

impl Default for ServerProfile {
    fn default() -> ServerProfile {
        ServerProfile {
            entries: vec![],
            paged: false,
            bind_rc: 0,
            compare_rc: 6,
            response_delay: None,
        }
    }
}

#[derive(Default)]
pub struct ServerStats {
    pub connections: AtomicUsize,
    pub binds: AtomicUsize,
    pub searches: AtomicUsize,
    pub adds: AtomicUsize,
    pub abandons: AtomicUsize,
    pub unbinds: AtomicUsize,
}

/// Start the server on the given listener; serves until the test ends.
pub fn serve(listener: TcpListener, profile: ServerProfile) -> Arc<ServerStats> {
    let stats = Arc::new(ServerStats::default());
    let conn_stats = stats.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            conn_stats.connections.fetch_add(1, Ordering::SeqCst);
            let profile = profile.clone();
            let stats = conn_stats.clone();
            tokio::spawn(async move {
                serve_conn(socket, profile, stats).await;
            });
        }
    });
    stats
}

/// Same server over a Unix domain socket.
#[cfg(unix)]
pub fn serve_unix(listener: UnixListener, profile: ServerProfile) -> Arc<ServerStats> {
    let stats = Arc::new(ServerStats::default());
    let conn_stats = stats.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            conn_stats.connections.fetch_add(1, Ordering::SeqCst);
            let profile = profile.clone();
            let stats = conn_stats.clone();
            tokio::spawn(async move {
                serve_conn(socket, profile, stats).await;
            });
        }
    });
    stats
}

async fn serve_conn<S>(mut socket: S, profile: ServerProfile, stats: Arc<ServerStats>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        while let Some((msgid, op, controls)) = next_frame(&mut buf) {
            if let Some(delay) = profile.response_delay {
                time::sleep(delay).await;
            }
            match op.id {
                // BindRequest
                0 => {
                    stats.binds.fetch_add(1, Ordering::SeqCst);
                    send(&mut socket, msgid, result_op(1, profile.bind_rc), None).await;
                }
                // UnbindRequest
                2 => {
                    stats.unbinds.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                // SearchRequest
                3 => {
                    stats.searches.fetch_add(1, Ordering::SeqCst);
                    answer_search(&mut socket, &profile, msgid, controls).await;
                }
                // ModifyRequest
                6 => send(&mut socket, msgid, result_op(7, 0), None).await,
                // AddRequest
                8 => {
                    stats.adds.fetch_add(1, Ordering::SeqCst);
                    send(&mut socket, msgid, result_op(9, 0), None).await;
                }
                // DelRequest
                10 => send(&mut socket, msgid, result_op(11, 0), None).await,
                // ModifyDNRequest
                12 => send(&mut socket, msgid, result_op(13, 0), None).await,
                // CompareRequest
                14 => send(&mut socket, msgid, result_op(15, profile.compare_rc), None).await,
                // AbandonRequest
                16 => {
                    stats.abandons.fetch_add(1, Ordering::SeqCst);
                }
                // ExtendedRequest
                23 => send(&mut socket, msgid, whoami_op(), None).await,
                other => panic!("mock server: unhandled protocol op {}", other),
            }
        }
        match socket.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => (),
        }
    }
}

async fn answer_search<S>(
    socket: &mut S,
    profile: &ServerProfile,
    msgid: i32,
    controls: Option<StructureTag>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let paging = if profile.paged {
        controls.and_then(paged_request)
    } else {
        None
    };
    match paging {
        None => {
            for dn in &profile.entries {
                send(socket, msgid, entry_op(dn), None).await;
            }
            send(socket, msgid, result_op(5, 0), None).await;
        }
        Some((size, cookie)) => {
            let offset: usize = if cookie.is_empty() {
                0
            } else {
                String::from_utf8(cookie).expect("cookie").parse().expect("offset")
            };
            let end = (offset + size.max(0) as usize).min(profile.entries.len());
            for dn in &profile.entries[offset..end] {
                send(socket, msgid, entry_op(dn), None).await;
            }
            let next_cookie = if end < profile.entries.len() {
                end.to_string().into_bytes()
            } else {
                vec![]
            };
            let ctrl = paged_control(next_cookie);
            send(socket, msgid, result_op(5, 0), Some(ctrl)).await;
        }
    }
}

/// Extract (size, cookie) from a request's PagedResults control, if any.
fn paged_request(controls: StructureTag) -> Option<(i32, Vec<u8>)> {
    let controls = controls.expect_constructed()?;
    for ctrl in controls {
        let mut parts = ctrl.expect_constructed()?.into_iter();
        let oid = String::from_utf8(parts.next()?.expect_primitive()?).ok()?;
        if oid != PAGED_OID {
            continue;
        }
        // skip an optional criticality flag
        let mut val = parts.next()?;
        if val.id == 1 {
            val = parts.next()?;
        }
        let val = val.expect_primitive()?;
        let (_, inner) = parse_tag(&val).ok()?;
        let mut comps = inner.expect_constructed()?.into_iter();
        let size = match parse_uint(&comps.next()?.expect_primitive()?) {
            Ok((_, size)) => size as i32,
            _ => return None,
        };
        let cookie = comps.next()?.expect_primitive()?;
        return Some((size, cookie));
    }
    None
}

/// An LDAPResult-bodied response with the given application tag.
fn result_op(app_id: u64, rc: u32) -> Tag {
    Tag::Sequence(Sequence {
        id: app_id,
        class: TagClass::Application,
        inner: vec![
            Tag::Enumerated(Enumerated {
                inner: rc as i64,
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: vec![],
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: vec![],
                ..Default::default()
            }),
        ],
    })
}

/// A SearchResultEntry with one attribute.
fn entry_op(dn: &str) -> Tag {
    Tag::Sequence(Sequence {
        id: 4,
        class: TagClass::Application,
        inner: vec![
            Tag::OctetString(OctetString {
                inner: Vec::from(dn.as_bytes()),
                ..Default::default()
            }),
            Tag::Sequence(Sequence {
                inner: vec![Tag::Sequence(Sequence {
                    inner: vec![
                        Tag::OctetString(OctetString {
                            inner: Vec::from(&b"objectClass"[..]),
                            ..Default::default()
                        }),
                        Tag::Set(Set {
                            inner: vec![Tag::OctetString(OctetString {
                                inner: Vec::from(&b"top"[..]),
                                ..Default::default()
                            })],
                            ..Default::default()
                        }),
                    ],
                    ..Default::default()
                })],
                ..Default::default()
            }),
        ],
    })
}

/// An ExtendedResponse carrying a WhoAmI-style response value.
fn whoami_op() -> Tag {
    Tag::Sequence(Sequence {
        id: 24,
        class: TagClass::Application,
        inner: vec![
            Tag::Enumerated(Enumerated {
                inner: 0,
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: vec![],
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: vec![],
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                id: 11,
                class: TagClass::Context,
                inner: Vec::from(&b"dn:cn=admin,dc=example,dc=org"[..]),
            }),
        ],
    })
}

/// A response PagedResults control with the given cookie.
fn paged_control(cookie: Vec<u8>) -> StructureTag {
    let mut val = BytesMut::new();
    write::encode_into(
        &mut val,
        Tag::Sequence(Sequence {
            inner: vec![
                Tag::Integer(Integer {
                    inner: 0,
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    inner: cookie,
                    ..Default::default()
                }),
            ],
            ..Default::default()
        })
        .into_structure(),
    )
    .expect("paged control value");
    let control = Tag::Sequence(Sequence {
        inner: vec![
            Tag::OctetString(OctetString {
                inner: Vec::from(PAGED_OID.as_bytes()),
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: Vec::from(&val[..]),
                ..Default::default()
            }),
        ],
        ..Default::default()
    })
    .into_structure();
    StructureTag {
        id: 0,
        class: TagClass::Context,
        payload: PL::C(vec![control]),
    }
}

async fn send<S>(socket: &mut S, msgid: i32, op: Tag, controls: Option<StructureTag>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut inner = vec![
        Tag::Integer(Integer {
            inner: msgid as i64,
            ..Default::default()
        }),
        op,
    ];
    if let Some(controls) = controls {
        inner.push(Tag::StructureTag(controls));
    }
    let msg = Tag::Sequence(Sequence {
        inner,
        ..Default::default()
    })
    .into_structure();
    let mut out = BytesMut::new();
    write::encode_into(&mut out, msg).expect("encoded response");
    socket.write_all(&out).await.expect("response write");
}

/// Split the next LDAPMessage off the buffer: (msgid, protocol op, controls).
fn next_frame(buf: &mut BytesMut) -> Option<(i32, StructureTag, Option<StructureTag>)> {
    let mut parser = Parser::new();
    let (rest_len, tag) = match parser.parse(buf) {
        Ok((rest, ref tag)) => (rest.len(), tag.clone()),
        Err(_) => return None,
    };
    buf.advance(buf.len() - rest_len);
    let mut tags = tag.expect_constructed().expect("ldap message");
    let controls = if tags.len() > 2 { tags.pop() } else { None };
    let op = tags.pop().expect("protocol op");
    let msgid_raw = tags
        .pop()
        .expect("message id")
        .expect_primitive()
        .expect("integer");
    let msgid = match parse_uint(&msgid_raw) {
        Ok((_, id)) => id as i32,
        _ => panic!("mock server: bad message id"),
    };
    Some((msgid, op, controls))
}
