use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::conn::{ConnCtl, ConnEvent};
use crate::controls_impl::IntoControlList;
use crate::exop::Exop;
use crate::exop_impl::construct_exop;
use crate::protocol::{LdapOp, MaybeControls, OpEnvelope};
use crate::result::{
    CompareResult, ExopResult, LdapError, LdapResult, ParsedResult, Result, SearchResult,
};
use crate::search::{SearchOptions, SearchStream, StreamState};
use crate::tracker::MessageTracker;
use crate::util::{split_new_dn, validate_dn};
use crate::RequestId;

use lber::common::TagClass;
use lber::structures::{Boolean, Enumerated, Integer, Null, OctetString, Sequence, Set, Tag};

use tokio::sync::{mpsc, oneshot};
use tokio::time;

pub(crate) const LDAP_SUCCESS: u32 = 0;
pub(crate) const LDAP_COMPARE_FALSE: u32 = 5;
pub(crate) const LDAP_COMPARE_TRUE: u32 = 6;

/// One change of a Modify operation, applied to a single attribute.
#[derive(Clone, Debug, PartialEq)]
pub enum Mod<S: AsRef<[u8]> + Eq + Hash> {
    /// Add the given values to the attribute; the set must not be empty.
    Add(S, HashSet<S>),
    /// Delete the given values, or the whole attribute for an empty set.
    Delete(S, HashSet<S>),
    /// Make the set the attribute's new values; an empty set deletes the
    /// attribute.
    Replace(S, HashSet<S>),
    /// Increment the attribute by the given value (RFC 4525).
    Increment(S, S),
}

/// Asynchronous handle for LDAP operations.
///
/// Operations are plain async methods on this handle. Two chainable
/// modifiers adjust the next operation invoked on the handle:
/// [`with_controls()`](#method.with_controls) attaches request controls
/// to it, and [`with_timeout()`](#method.with_timeout) bounds how long
/// the caller waits for its outcome.
///
/// Every operation validates its arguments before any I/O: a malformed DN
/// (with strict DN checking on) or filter is reported synchronously,
/// without touching the wire. An operation whose server result falls
/// outside the codes it expects (zero for most, compareTrue/compareFalse
/// for Compare) returns the result as an `LdapError`.
///
/// Clones of the handle are cheap, and every clone multiplexes its
/// operations over the one shared connection. While that connection is
/// down, operations are held in its request queue and dispatched, in
/// order, once the connection is restored; see
/// [`LdapConnSettings`](struct.LdapConnSettings.html) for the queue and
/// reconnection knobs.
#[derive(Debug)]
pub struct Ldap {
    pub(crate) tracker: Arc<Mutex<MessageTracker>>,
    pub(crate) tx: mpsc::UnboundedSender<OpEnvelope>,
    pub(crate) id_scrub_tx: mpsc::UnboundedSender<RequestId>,
    pub(crate) ctl_tx: mpsc::UnboundedSender<ConnCtl>,
    pub(crate) event_tx: mpsc::UnboundedSender<ConnEvent>,
    pub(crate) last_id: RequestId,
    pub(crate) strict_dn: bool,
    pub(crate) default_timeout: Option<Duration>,
    pub timeout: Option<Duration>,
    pub controls: MaybeControls,
}

impl Clone for Ldap {
    fn clone(&self) -> Self {
        Ldap {
            tracker: self.tracker.clone(),
            tx: self.tx.clone(),
            id_scrub_tx: self.id_scrub_tx.clone(),
            ctl_tx: self.ctl_tx.clone(),
            event_tx: self.event_tx.clone(),
            last_id: 0,
            strict_dn: self.strict_dn,
            default_timeout: self.default_timeout,
            timeout: None,
            controls: None,
        }
    }
}

impl Ldap {
    fn alloc_id(&mut self) -> RequestId {
        let mut tracker = self.tracker.lock().expect("tracker mutex (alloc)");
        tracker.alloc_id()
    }

    fn check_dn(&self, dn: &str) -> Result<()> {
        if self.strict_dn {
            validate_dn(dn)?;
        }
        Ok(())
    }

    pub(crate) async fn op_call(&mut self, op: LdapOp, req: Tag) -> Result<(LdapResult, Exop)> {
        let id = self.alloc_id();
        self.last_id = id;
        let (tx, rx) = oneshot::channel();
        let env = OpEnvelope {
            id,
            op,
            tag: req,
            controls: self.controls.take(),
            tx,
        };
        self.tx.send(env).map_err(|_| LdapError::ConnectionClosed)?;
        let timeout = self.timeout.take().or(self.default_timeout);
        let response = if let Some(timeout) = timeout {
            match time::timeout(timeout, rx).await {
                Ok(response) => response,
                Err(elapsed) => {
                    // tell the server we no longer want an answer, then
                    // report the local timeout
                    self.abandon_in_background(id);
                    let _ = self.event_tx.send(ConnEvent::Timeout);
                    return Err(LdapError::from(elapsed));
                }
            }
        } else {
            rx.await
        };
        // a dropped sender means the connection went away without replying
        let (tag, controls) = response.map_err(|_| LdapError::ConnectionClosed)??;
        let parsed = ParsedResult::parse(tag)?;
        let mut result = parsed.result;
        result.ctrls = controls;
        Ok((result, parsed.exop))
    }

    /// Run an operation and check the result code against the codes the
    /// operation expects. Any other code is reported to the caller as an
    /// error, and echoed on the connection's event channel.
    pub(crate) async fn op_expect(
        &mut self,
        op: LdapOp,
        req: Tag,
        expect: &[u32],
    ) -> Result<LdapResult> {
        let (result, _) = self.op_call(op, req).await?;
        if !expect.contains(&result.rc) {
            let _ = self
                .event_tx
                .send(ConnEvent::ResultError(result.clone()));
            return Err(LdapError::LdapResult { result });
        }
        Ok(result)
    }

    /// Fire-and-forget wire Abandon for `msgid`, used when a local timeout
    /// gives up on a request the server may still be working on.
    fn abandon_in_background(&mut self, msgid: RequestId) {
        let id = self.alloc_id();
        let (tx, _rx) = oneshot::channel();
        let req = Tag::Integer(Integer {
            id: 16,
            class: TagClass::Application,
            inner: msgid as i64,
        });
        let _ = self.tx.send(OpEnvelope {
            id,
            op: LdapOp::Abandon(msgid),
            tag: req,
            controls: None,
            tx,
        });
    }

    /// Attach request controls to the next operation invoked on this
    /// handle.
    ///
    /// Anything covered by [`IntoControlList`](controls/trait.IntoControlList.html)
    /// is accepted: a vector of [`RawControl`](controls/struct.RawControl.html)s,
    /// or a single value convertible into one, such as the control structs
    /// in the [`controls`](controls/index.html) module. The operation can
    /// be chained directly onto the return value.
    pub fn with_controls<V: IntoControlList>(&mut self, ctrls: V) -> &mut Self {
        self.controls = Some(ctrls.into_list());
        self
    }

    /// Bound the next operation invoked on this handle to `duration`.
    ///
    /// A search stream applies the bound per reply, restarting the timer
    /// for each entry. On expiry the operation returns a timeout error
    /// and its message ID is abandoned on the server; the connection
    /// itself stays usable. The operation can be chained directly onto
    /// the return value.
    pub fn with_timeout(&mut self, duration: Duration) -> &mut Self {
        self.timeout = Some(duration);
        self
    }

    /// Authenticate with a simple Bind as `bind_dn`, using the password
    /// `bind_pw`; empty strings bind anonymously.
    pub async fn simple_bind(&mut self, bind_dn: &str, bind_pw: &str) -> Result<LdapResult> {
        self.check_dn(bind_dn)?;
        let req = bind_request(bind_dn, bind_pw);
        self.op_expect(LdapOp::Single, req, &[LDAP_SUCCESS]).await
    }

    /// Run a Search under `base` with the parameters in `opts` (see
    /// [`SearchOptions`](struct.SearchOptions.html)), gathering the whole
    /// result set before returning.
    ///
    /// Entries come back in wire form; decode each one with
    /// [`SearchEntry::construct()`](struct.SearchEntry.html#method.construct).
    /// Gathering everything is fine for result sets known to be modest;
    /// use [`streaming_search()`](#method.streaming_search) when the size
    /// is open-ended.
    pub async fn search(&mut self, base: &str, opts: SearchOptions) -> Result<SearchResult> {
        let mut stream = self.streaming_search(base, opts).await?;
        let mut re_vec = vec![];
        loop {
            while let Some(entry) = stream.next().await? {
                re_vec.push(entry);
            }
            if stream.state() == StreamState::PageEnd {
                stream.resume().await?;
                continue;
            }
            break;
        }
        let res = stream.finish().await;
        Ok(SearchResult(re_vec, res))
    }

    /// Start a Search like [`search()`](#method.search), but hand back a
    /// [`SearchStream`](struct.SearchStream.html) from which entries are
    /// pulled one at a time; see its documentation for the iteration
    /// protocol.
    pub async fn streaming_search(
        &mut self,
        base: &str,
        opts: SearchOptions,
    ) -> Result<SearchStream> {
        self.check_dn(base)?;
        let mut ldap = self.clone();
        ldap.controls = self.controls.take();
        ldap.timeout = self.timeout.take();
        let mut stream = SearchStream::new(ldap, base, opts);
        stream.start().await?;
        Ok(stream)
    }

    /// Add an entry at `dn` with the attributes in `attrs`. Every
    /// attribute needs at least one value; an empty value set fails the
    /// call before anything is sent.
    pub async fn add<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        attrs: Vec<(S, HashSet<S>)>,
    ) -> Result<LdapResult> {
        self.check_dn(dn)?;
        let mut any_empty = false;
        let req = Tag::Sequence(Sequence {
            id: 8,
            class: TagClass::Application,
            inner: vec![
                Tag::OctetString(OctetString {
                    inner: Vec::from(dn.as_bytes()),
                    ..Default::default()
                }),
                Tag::Sequence(Sequence {
                    inner: attrs
                        .into_iter()
                        .map(|(name, vals)| {
                            if vals.is_empty() {
                                any_empty = true;
                            }
                            Tag::Sequence(Sequence {
                                inner: vec![
                                    Tag::OctetString(OctetString {
                                        inner: Vec::from(name.as_ref()),
                                        ..Default::default()
                                    }),
                                    Tag::Set(Set {
                                        inner: vals
                                            .into_iter()
                                            .map(|v| {
                                                Tag::OctetString(OctetString {
                                                    inner: Vec::from(v.as_ref()),
                                                    ..Default::default()
                                                })
                                            })
                                            .collect(),
                                        ..Default::default()
                                    }),
                                ],
                                ..Default::default()
                            })
                        })
                        .collect(),
                    ..Default::default()
                }),
            ],
        });
        if any_empty {
            return Err(LdapError::AddNoValues);
        }
        self.op_expect(LdapOp::Single, req, &[LDAP_SUCCESS]).await
    }

    /// Ask the server whether attribute `attr` of the entry at `dn` holds
    /// the value `val`. A match answers with code 6 (`compareTrue`), a
    /// mismatch with 5 (`compareFalse`);
    /// [`CompareResult::equal()`](struct.CompareResult.html#method.equal)
    /// turns the pair into a boolean. Any other code is reported as an
    /// error.
    pub async fn compare<B: AsRef<[u8]>>(
        &mut self,
        dn: &str,
        attr: &str,
        val: B,
    ) -> Result<CompareResult> {
        self.check_dn(dn)?;
        let req = Tag::Sequence(Sequence {
            id: 14,
            class: TagClass::Application,
            inner: vec![
                Tag::OctetString(OctetString {
                    inner: Vec::from(dn.as_bytes()),
                    ..Default::default()
                }),
                Tag::Sequence(Sequence {
                    inner: vec![
                        Tag::OctetString(OctetString {
                            inner: Vec::from(attr.as_bytes()),
                            ..Default::default()
                        }),
                        Tag::OctetString(OctetString {
                            inner: Vec::from(val.as_ref()),
                            ..Default::default()
                        }),
                    ],
                    ..Default::default()
                }),
            ],
        });
        Ok(CompareResult(
            self.op_expect(
                LdapOp::Single,
                req,
                &[LDAP_COMPARE_FALSE, LDAP_COMPARE_TRUE],
            )
            .await?,
        ))
    }

    /// Delete an entry named by `dn`.
    pub async fn delete(&mut self, dn: &str) -> Result<LdapResult> {
        self.check_dn(dn)?;
        let req = Tag::OctetString(OctetString {
            id: 10,
            class: TagClass::Application,
            inner: Vec::from(dn.as_bytes()),
        });
        self.op_expect(LdapOp::Single, req, &[LDAP_SUCCESS]).await
    }

    /// Apply the changes in `mods`, in order, to the entry at `dn`; see
    /// [`Mod`](enum.Mod.html) for the change forms.
    pub async fn modify<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        mods: Vec<Mod<S>>,
    ) -> Result<LdapResult> {
        self.check_dn(dn)?;
        let mut any_add_empty = false;
        let req = Tag::Sequence(Sequence {
            id: 6,
            class: TagClass::Application,
            inner: vec![
                Tag::OctetString(OctetString {
                    inner: Vec::from(dn.as_bytes()),
                    ..Default::default()
                }),
                Tag::Sequence(Sequence {
                    inner: mods
                        .into_iter()
                        .map(|m| {
                            let mut is_add = false;
                            let (num, attr, set) = match m {
                                Mod::Add(attr, set) => {
                                    is_add = true;
                                    (0, attr, set)
                                }
                                Mod::Delete(attr, set) => (1, attr, set),
                                Mod::Replace(attr, set) => (2, attr, set),
                                Mod::Increment(attr, val) => (3, attr, HashSet::from([val])),
                            };
                            if set.is_empty() && is_add {
                                any_add_empty = true;
                            }
                            let op = Tag::Enumerated(Enumerated {
                                inner: num,
                                ..Default::default()
                            });
                            let part_attr = Tag::Sequence(Sequence {
                                inner: vec![
                                    Tag::OctetString(OctetString {
                                        inner: Vec::from(attr.as_ref()),
                                        ..Default::default()
                                    }),
                                    Tag::Set(Set {
                                        inner: set
                                            .into_iter()
                                            .map(|val| {
                                                Tag::OctetString(OctetString {
                                                    inner: Vec::from(val.as_ref()),
                                                    ..Default::default()
                                                })
                                            })
                                            .collect(),
                                        ..Default::default()
                                    }),
                                ],
                                ..Default::default()
                            });
                            Tag::Sequence(Sequence {
                                inner: vec![op, part_attr],
                                ..Default::default()
                            })
                        })
                        .collect(),
                    ..Default::default()
                }),
            ],
        });
        if any_add_empty {
            return Err(LdapError::AddNoValues);
        }
        self.op_expect(LdapOp::Single, req, &[LDAP_SUCCESS]).await
    }

    /// The general ModifyDN operation: give the entry at `dn` the new
    /// name `rdn`, optionally deleting the old naming attribute value
    /// (`delete_old`) and optionally reparenting the entry under
    /// `new_sup`. [`rename()`](#method.rename) covers the common case
    /// with fewer knobs.
    pub async fn modifydn(
        &mut self,
        dn: &str,
        rdn: &str,
        delete_old: bool,
        new_sup: Option<&str>,
    ) -> Result<LdapResult> {
        self.check_dn(dn)?;
        if let Some(new_sup) = new_sup {
            self.check_dn(new_sup)?;
        }
        let mut params = vec![
            Tag::OctetString(OctetString {
                inner: Vec::from(dn.as_bytes()),
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: Vec::from(rdn.as_bytes()),
                ..Default::default()
            }),
            Tag::Boolean(Boolean {
                inner: delete_old,
                ..Default::default()
            }),
        ];
        if let Some(new_sup) = new_sup {
            params.push(Tag::OctetString(OctetString {
                id: 0,
                class: TagClass::Context,
                inner: Vec::from(new_sup.as_bytes()),
            }));
        }
        let req = Tag::Sequence(Sequence {
            id: 12,
            class: TagClass::Application,
            inner: params,
        });
        self.op_expect(LdapOp::Single, req, &[LDAP_SUCCESS]).await
    }

    /// Rename the entry named by `dn` to `new_dn`. When `new_dn` has more
    /// than one RDN, the leading RDN becomes the entry's new name and the
    /// remainder names the new superior entry; otherwise the entry stays in
    /// place under its new RDN. The old naming attribute value is always
    /// deleted. For finer control, use [`modifydn()`](#method.modifydn).
    pub async fn rename(&mut self, dn: &str, new_dn: &str) -> Result<LdapResult> {
        self.check_dn(new_dn)?;
        let (rdn, new_sup) = split_new_dn(new_dn);
        self.modifydn(dn, rdn, true, new_sup).await
    }

    /// Send the Extended operation `exop`: anything convertible into the
    /// generic [`Exop`](exop/struct.Exop.html) form, including the
    /// operations shipped in the [`exop`](exop/index.html) module and any
    /// custom one built the same way.
    pub async fn extended<E>(&mut self, exop: E) -> Result<ExopResult>
    where
        E: Into<Exop>,
    {
        let req = Tag::Sequence(Sequence {
            id: 23,
            class: TagClass::Application,
            inner: construct_exop(exop.into()),
        });
        let (result, exop) = self.op_call(LdapOp::Single, req).await?;
        if result.rc != LDAP_SUCCESS {
            let _ = self
                .event_tx
                .send(ConnEvent::ResultError(result.clone()));
            return Err(LdapError::LdapResult { result });
        }
        Ok(ExopResult(exop, result))
    }

    /// Terminate the connection to the server.
    ///
    /// An UnbindRequest is written and the outgoing half of the socket is
    /// closed; the call completes when the connection has shut down, and
    /// no reconnection is attempted afterwards. If the connection is
    /// already down, the call completes immediately.
    pub async fn unbind(&mut self) -> Result<()> {
        let req = Tag::Null(Null {
            id: 2,
            class: TagClass::Application,
            inner: (),
        });
        self.op_call(LdapOp::Unbind, req).await.map(|_| ())
    }

    /// The message ID of this handle's most recent operation, zero on a
    /// fresh handle. Useful for abandoning an operation that timed out.
    pub fn last_id(&mut self) -> RequestId {
        self.last_id
    }

    /// Ask the server to abandon an operation identified by `msgid`. The
    /// call returns once the AbandonRequest has been written out; from that
    /// point, any remaining responses for `msgid` are dropped without
    /// reaching their requester.
    pub async fn abandon(&mut self, msgid: RequestId) -> Result<()> {
        let req = Tag::Integer(Integer {
            id: 16,
            class: TagClass::Application,
            inner: msgid as i64,
        });
        self.op_call(LdapOp::Abandon(msgid), req).await.map(|_| ())
    }

    /// Tear the client down: freeze the request queue, fail every
    /// outstanding and queued request, destroy the socket, and disable
    /// reconnection. All subsequent operations fail. Calling `destroy` on
    /// an already destroyed client is a no-op.
    pub async fn destroy(&mut self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.ctl_tx.send(ConnCtl::Destroy(tx)).is_err() {
            // the connection is already gone
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Whether the connection task has gone away.
    ///
    /// Only the request channel is inspected, not the socket, so `false`
    /// doesn't prove the server is reachable; a cheap round trip such as
    /// `WhoAmI` does that.
    pub fn is_closed(&mut self) -> bool {
        self.tx.is_closed()
    }
}

pub(crate) fn bind_request(bind_dn: &str, bind_pw: &str) -> Tag {
    Tag::Sequence(Sequence {
        id: 0,
        class: TagClass::Application,
        inner: vec![
            Tag::Integer(Integer {
                inner: 3,
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: Vec::from(bind_dn),
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                id: 0,
                class: TagClass::Context,
                inner: Vec::from(bind_pw),
            }),
        ],
    })
}
