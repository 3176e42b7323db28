use std::collections::HashMap;
use std::time::Duration;

use crate::controls::{Control, ControlType, PagedResults, RawControl};
use crate::controls_impl::{ControlParser, PAGED_RESULTS_OID};
use crate::ldap::Ldap;
use crate::parse_filter;
use crate::protocol::LdapOp;
use crate::result::{LdapError, LdapResult, ParsedResult, Result};

use tokio::sync::mpsc;
use tokio::time;

use lber::common::TagClass;
use lber::structure::StructureTag;
use lber::structures::{Boolean, Enumerated, Integer, OctetString, Sequence, Tag};

use log::warn;

/// How far below the base DN a search reaches.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Scope {
    /// Only the entry at the base DN itself.
    #[default]
    Base = 0,
    /// The immediate children of the base DN.
    OneLevel = 1,
    /// The base DN and everything below it.
    Subtree = 2,
}

/// When the server dereferences aliases during a search.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum DerefAliases {
    /// Never.
    #[default]
    Never = 0,
    /// While walking entries within the search scope.
    Searching = 1,
    /// While locating the base entry.
    Finding = 2,
    /// In both phases.
    Always = 3,
}

#[derive(Debug)]
pub enum SearchItem {
    Entry(StructureTag),
    Referral(StructureTag),
    /// The terminal SearchResultDone op, still in wire form; the stream
    /// decodes it where a decoding error has somewhere to go.
    Done(StructureTag),
}

/// One search response item in wire form, with its response controls.
///
/// Most items are entries, decodable with
/// [`SearchEntry::construct()`](struct.SearchEntry.html#method.construct);
/// the predicates tell the other kinds apart.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ResultEntry(pub StructureTag, pub Vec<Control>);

impl ResultEntry {
    #[doc(hidden)]
    pub fn new(st: StructureTag) -> ResultEntry {
        ResultEntry(st, vec![])
    }

    /// Whether this item is a search referral.
    pub fn is_ref(&self) -> bool {
        self.0.id == 19
    }

    /// Whether this item is an intermediate response message.
    pub fn is_intermediate(&self) -> bool {
        self.0.id == 25
    }
}

/// Parameters of the Search operation.
///
/// Only the search base is passed separately; every other parameter has a
/// default: the `Base` scope, a presence filter on `objectClass`, no alias
/// dereferencing, no size limit, a time limit of 10 seconds, and the full
/// attribute list.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct SearchOptions {
    pub scope: Scope,
    pub filter: String,
    pub attrs: Vec<String>,
    pub deref: DerefAliases,
    pub typesonly: bool,
    pub timelimit: i32,
    pub sizelimit: i32,
    /// Engage server-side paging with the given page size. A non-positive
    /// size picks the default: one less than `sizelimit` if that is above
    /// one, otherwise 100.
    pub paged: Option<i32>,
    /// Park the stream at each page boundary instead of chasing the next
    /// page automatically. See [`SearchStream::resume()`](struct.SearchStream.html#method.resume).
    pub page_pause: bool,
}

impl Default for SearchOptions {
    fn default() -> SearchOptions {
        SearchOptions {
            scope: Scope::Base,
            filter: String::from("(objectClass=*)"),
            attrs: vec![],
            deref: DerefAliases::Never,
            typesonly: false,
            timelimit: 10,
            sizelimit: 0,
            paged: None,
            page_pause: false,
        }
    }
}

impl SearchOptions {
    /// Start from the defaults described on the struct.
    pub fn new() -> Self {
        SearchOptions {
            ..Default::default()
        }
    }

    /// Set the search scope.
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Set the filter string.
    pub fn filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.filter = filter.into();
        self
    }

    /// Set the list of attributes to return. An empty list, the default,
    /// means all user attributes.
    pub fn attrs<S: Into<String>, A: IntoIterator<Item = S>>(mut self, attrs: A) -> Self {
        self.attrs = attrs.into_iter().map(Into::into).collect();
        self
    }

    /// Set the alias dereferencing mode.
    pub fn deref(mut self, d: DerefAliases) -> Self {
        self.deref = d;
        self
    }

    /// Ask for attribute names without their values.
    pub fn typesonly(mut self, typesonly: bool) -> Self {
        self.typesonly = typesonly;
        self
    }

    /// Set the time limit, in seconds, the server may spend on the search.
    ///
    /// This is enforced on the server, per protocol operation: a paged
    /// search gets the limit anew for every page. It's unrelated to the
    /// client-side [`with_timeout()`](struct.Ldap.html#method.with_timeout)
    /// network timeout.
    pub fn timelimit(mut self, timelimit: i32) -> Self {
        self.timelimit = timelimit;
        self
    }

    /// Set the ceiling, in entries, the server may return for the search.
    /// Like the time limit, it's server-enforced and per protocol
    /// operation.
    pub fn sizelimit(mut self, sizelimit: i32) -> Self {
        self.sizelimit = sizelimit;
        self
    }

    /// Request a paged search with the given page size; see the field docs
    /// for the handling of non-positive sizes.
    pub fn paged(mut self, page_size: i32) -> Self {
        self.paged = Some(page_size);
        self
    }

    /// Set whether a paged search pauses at page boundaries.
    pub fn page_pause(mut self, pause: bool) -> Self {
        self.page_pause = pause;
        self
    }
}

/// A search result entry decoded into maps of attribute values.
///
/// The wire carries every attribute value as an untyped octet string.
/// Values that decode as UTF-8 land in `attrs` as `String`s, which is
/// what callers want nearly all the time; an attribute with even one
/// non-UTF-8 value goes, whole, into `bin_attrs` instead. An attribute
/// holding binary data can thus still show up under `attrs` when all of
/// its current values happen to decode, so code reading such attributes
/// should look in both maps.
#[derive(Debug, Clone)]
pub struct SearchEntry {
    /// Entry DN.
    pub dn: String,
    /// Attributes.
    pub attrs: HashMap<String, Vec<String>>,
    /// Binary-valued attributes.
    pub bin_attrs: HashMap<String, Vec<Vec<u8>>>,
}

impl SearchEntry {
    /// Decode a result entry into the DN and the attribute maps.
    ///
    /// Panics if the BER structure isn't a SearchResultEntry; entries
    /// handed out by a search stream always are.
    pub fn construct(re: ResultEntry) -> SearchEntry {
        match Self::decode(re) {
            Ok(entry) => entry,
            Err(what) => panic!("malformed search entry: bad {}", what),
        }
    }

    fn decode(re: ResultEntry) -> std::result::Result<SearchEntry, &'static str> {
        let mut comps = re
            .0
            .match_id(4)
            .and_then(|t| t.expect_constructed())
            .ok_or("entry sequence")?
            .into_iter();
        let dn = comps
            .next()
            .and_then(|t| t.expect_primitive())
            .and_then(|v| String::from_utf8(v).ok())
            .ok_or("entry dn")?;
        let attr_list = comps
            .next()
            .and_then(|t| t.expect_constructed())
            .ok_or("attribute list")?;
        let mut attrs = HashMap::new();
        let mut bin_attrs = HashMap::new();
        for partial in attr_list {
            let mut partial = partial
                .expect_constructed()
                .ok_or("partial attribute")?
                .into_iter();
            let name = partial
                .next()
                .and_then(|t| t.expect_primitive())
                .and_then(|v| String::from_utf8(v).ok())
                .ok_or("attribute type")?;
            let raw_vals = partial
                .next()
                .and_then(|t| t.expect_constructed())
                .ok_or("attribute values")?;
            // values stay strings until the first one that isn't UTF-8;
            // from then on the whole attribute is binary, order preserved
            let mut text: Vec<String> = Vec::with_capacity(raw_vals.len());
            let mut binary: Vec<Vec<u8>> = vec![];
            for val in raw_vals {
                let val = val.expect_primitive().ok_or("attribute value")?;
                match String::from_utf8(val) {
                    Ok(s) if binary.is_empty() => text.push(s),
                    Ok(s) => binary.push(s.into_bytes()),
                    Err(e) => {
                        binary.extend(text.drain(..).map(String::into_bytes));
                        binary.push(e.into_bytes());
                    }
                }
            }
            if binary.is_empty() {
                attrs.insert(name, text);
            } else {
                bin_attrs.insert(name, binary);
            }
        }
        Ok(SearchEntry {
            dn,
            attrs,
            bin_attrs,
        })
    }
}

/// Possible states of a `SearchStream`.
///
/// Every stream is created in the `Fresh` state and becomes `Active` once
/// the protocol request has been written to the socket. Iterating with
/// [`next()`](struct.SearchStream.html#method.next) requires an `Active`
/// stream; the final protocol result moves the stream to `Done`, and
/// [`finish()`](struct.SearchStream.html#method.finish) to `Closed`. A
/// pausing paged search additionally parks in `PageEnd` between pages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamState {
    /// No protocol request sent yet.
    Fresh,
    /// Producing entries through `next()`.
    Active,
    /// Parked at a page boundary, waiting for `resume()`.
    PageEnd,
    /// All entries delivered; the final result is in.
    Done,
    /// `finish()` has run; nothing more to read.
    Closed,
    /// A fallible step failed and the stream is unusable.
    Error,
}

struct PagedState {
    size: i32,
    cookie: Vec<u8>,
    pause: bool,
}

/// Asynchronous handle for obtaining a stream of search results.
///
/// Streams come from
/// [`streaming_search()`](struct.Ldap.html#method.streaming_search) on an
/// `Ldap` handle; there is no way to build one directly.
///
/// The connection feeds the stream as responses are parsed off the socket,
/// whether or not anyone is reading; nothing is lost if the consumer shows
/// up late, since every event is buffered in arrival order until the first
/// [`next()`](#method.next) drains it.
///
/// The expected life of a stream: call `next()` until it yields
/// `Ok(None)` or an error, then take the search's overall result from
/// [`finish()`](#method.finish). A `finish()` before the stream ran dry
/// only stops local processing; telling the server to stop is on the
/// caller, via an Abandon or Cancel.
///
/// For a paged search, the stream transparently chases server pages by
/// reissuing the search with the cookie of the previous page, so `next()`
/// yields entries until the whole result set is exhausted. With
/// [`page_pause`](struct.SearchOptions.html#method.page_pause), `next()`
/// instead returns `Ok(None)` at every page boundary; the caller observes
/// the page through [`page_result()`](#method.page_result) and continues
/// with [`resume()`](#method.resume), or cuts the search short with
/// [`resume_with()`](#method.resume_with).
pub struct SearchStream {
    ldap: Ldap,
    rx: Option<mpsc::UnboundedReceiver<(SearchItem, Vec<Control>)>>,
    state: StreamState,
    timeout: Option<Duration>,
    base: String,
    opts: SearchOptions,
    user_controls: Vec<RawControl>,
    paging: Option<PagedState>,
    pages: usize,
    requests: usize,
    page_res: Option<LdapResult>,
    pub res: Option<LdapResult>,
}

impl SearchStream {
    pub(crate) fn new(ldap: Ldap, base: &str, opts: SearchOptions) -> Self {
        SearchStream {
            ldap,
            rx: None,
            state: StreamState::Fresh,
            timeout: None,
            base: String::from(base),
            opts,
            user_controls: vec![],
            paging: None,
            pages: 0,
            requests: 0,
            page_res: None,
            res: None,
        }
    }

    pub(crate) async fn start(&mut self) -> Result<()> {
        if self.state != StreamState::Fresh {
            return Ok(());
        }
        if parse_filter(&self.opts.filter).is_err() {
            self.state = StreamState::Error;
            return Err(LdapError::FilterParsing);
        }
        self.timeout = self.ldap.timeout.take();
        self.user_controls = self.ldap.controls.take().unwrap_or_default();
        // a caller-supplied control engages paging just like the option
        let supplied = self
            .user_controls
            .iter()
            .position(|rc| rc.oid == PAGED_RESULTS_OID);
        if let Some(pos) = supplied {
            let pr = match self.user_controls[pos].value {
                Some(ref v) => PagedResults::parse(v),
                None => PagedResults {
                    size: 0,
                    cookie: vec![],
                },
            };
            self.user_controls.remove(pos);
            self.paging = Some(PagedState {
                size: if pr.size > 0 {
                    pr.size
                } else {
                    self.default_page_size()
                },
                cookie: pr.cookie,
                pause: self.opts.page_pause,
            });
        } else if let Some(size) = self.opts.paged {
            self.paging = Some(PagedState {
                size: if size > 0 {
                    size
                } else {
                    self.default_page_size()
                },
                cookie: vec![],
                pause: self.opts.page_pause,
            });
        }
        let res = self.issue_request().await;
        if res.is_err() {
            self.state = StreamState::Error;
        }
        res
    }

    fn default_page_size(&self) -> i32 {
        if self.opts.sizelimit > 1 {
            self.opts.sizelimit - 1
        } else {
            100
        }
    }

    /// Send one wire Search request, reusing this stream for its results.
    async fn issue_request(&mut self) -> Result<()> {
        let req = self.build_request()?;
        let mut controls = self.user_controls.clone();
        if let Some(ref paging) = self.paging {
            controls.push(RawControl::from(PagedResults {
                size: paging.size,
                cookie: paging.cookie.clone(),
            }));
        }
        self.ldap.controls = if controls.is_empty() {
            None
        } else {
            Some(controls)
        };
        if let Some(timeout) = self.timeout {
            self.ldap.with_timeout(timeout);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.rx = Some(rx);
        self.ldap.op_call(LdapOp::Search(tx), req).await?;
        self.requests += 1;
        self.state = StreamState::Active;
        Ok(())
    }

    fn build_request(&self) -> Result<Tag> {
        Ok(Tag::Sequence(Sequence {
            id: 3,
            class: TagClass::Application,
            inner: vec![
                Tag::OctetString(OctetString {
                    inner: Vec::from(self.base.as_bytes()),
                    ..Default::default()
                }),
                Tag::Enumerated(Enumerated {
                    inner: self.opts.scope as i64,
                    ..Default::default()
                }),
                Tag::Enumerated(Enumerated {
                    inner: self.opts.deref as i64,
                    ..Default::default()
                }),
                Tag::Integer(Integer {
                    inner: self.opts.sizelimit as i64,
                    ..Default::default()
                }),
                Tag::Integer(Integer {
                    inner: self.opts.timelimit as i64,
                    ..Default::default()
                }),
                Tag::Boolean(Boolean {
                    inner: self.opts.typesonly,
                    ..Default::default()
                }),
                match parse_filter(&self.opts.filter) {
                    Ok(filter) => filter,
                    _ => return Err(LdapError::FilterParsing),
                },
                Tag::Sequence(Sequence {
                    inner: self
                        .opts
                        .attrs
                        .iter()
                        .map(|s| {
                            Tag::OctetString(OctetString {
                                inner: Vec::from(s.as_bytes()),
                                ..Default::default()
                            })
                        })
                        .collect(),
                    ..Default::default()
                }),
            ],
        }))
    }

    /// Fetch the next entry or referral from the result stream.
    ///
    /// Returns `Ok(None)` at the end of the stream, or, for a pausing paged
    /// search, at each page boundary.
    #[allow(clippy::should_implement_trait)]
    pub async fn next(&mut self) -> Result<Option<ResultEntry>> {
        loop {
            if self.state != StreamState::Active {
                return Ok(None);
            }
            let item = if let Some(timeout) = self.timeout {
                let res = time::timeout(timeout, self.rx.as_mut().unwrap().recv()).await;
                if res.is_err() {
                    let last_id = self.ldap.last_id();
                    let _ = self.ldap.id_scrub_tx.send(last_id);
                    self.state = StreamState::Error;
                }
                res?
            } else {
                self.rx.as_mut().unwrap().recv().await
            };
            let (item, controls) = match item {
                Some((item, controls)) => (item, controls),
                None => {
                    // the connection dropped the sender, most likely a close purge
                    self.rx = None;
                    self.state = StreamState::Error;
                    return Err(LdapError::EndOfStream);
                }
            };
            match item {
                SearchItem::Entry(tag) | SearchItem::Referral(tag) => {
                    return Ok(Some(ResultEntry(tag, controls)))
                }
                SearchItem::Done(tag) => {
                    let mut res = match ParsedResult::parse(Tag::StructureTag(tag)) {
                        Ok(parsed) => parsed.result,
                        Err(e) => {
                            self.rx = None;
                            self.state = StreamState::Error;
                            return Err(e);
                        }
                    };
                    res.ctrls = controls;
                    self.rx = None;
                    if self.paging.is_none() || res.rc != 0 {
                        self.res = Some(res);
                        self.state = StreamState::Done;
                        return Ok(None);
                    }
                    let cookie = match page_cookie(&res) {
                        Some(cookie) => cookie,
                        None => {
                            self.state = StreamState::Error;
                            return Err(LdapError::PagedResultsNotSupported);
                        }
                    };
                    self.pages += 1;
                    if cookie.is_empty() {
                        self.page_res = Some(res.clone());
                        self.res = Some(res);
                        self.state = StreamState::Done;
                        return Ok(None);
                    }
                    let paging = self.paging.as_mut().expect("paging state");
                    paging.cookie = cookie;
                    let pause = paging.pause;
                    self.page_res = Some(res);
                    if pause {
                        self.state = StreamState::PageEnd;
                        return Ok(None);
                    }
                    self.issue_request().await.map_err(|e| {
                        self.state = StreamState::Error;
                        e
                    })?;
                }
            }
        }
    }

    /// Continue a paged search parked at a page boundary by requesting the
    /// next page. A no-op in any other state.
    pub async fn resume(&mut self) -> Result<()> {
        self.resume_with(false).await
    }

    /// Continue a parked paged search, or, with `stop` set, finish it;
    /// the result of the last retrieved page becomes the overall result.
    pub async fn resume_with(&mut self, stop: bool) -> Result<()> {
        if self.state != StreamState::PageEnd {
            return Ok(());
        }
        if stop {
            self.res = self.page_res.clone();
            self.state = StreamState::Done;
            return Ok(());
        }
        let res = self.issue_request().await;
        if res.is_err() {
            self.state = StreamState::Error;
        }
        res
    }

    /// Close the stream and take the search's overall result: the
    /// server's, when the stream was read to its end, or a synthetic
    /// cancellation result for a stream given up early. In the latter
    /// case the server hasn't been told anything; abandoning the
    /// operation is up to the caller.
    pub async fn finish(&mut self) -> LdapResult {
        if self.state == StreamState::Closed {
            return LdapResult::synthetic(80, "stream already finalized");
        }
        if self.state != StreamState::Done {
            let last_id = self.ldap.last_id();
            if let Err(e) = self.ldap.id_scrub_tx.send(last_id) {
                warn!("finish: couldn't scrub tracking of op {}: {}", last_id, e);
            }
        }
        self.state = StreamState::Closed;
        self.rx = None;
        self.res
            .take()
            .unwrap_or_else(|| LdapResult::synthetic(88, "user cancelled"))
    }

    /// The result of the most recently completed page of a paged search.
    pub fn page_result(&self) -> Option<&LdapResult> {
        self.page_res.as_ref()
    }

    /// The number of completed pages of a paged search.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// The number of wire Search requests issued so far: one for a plain
    /// search, one per page for a paged one.
    pub fn requests_sent(&self) -> usize {
        self.requests
    }

    /// The stream's current state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// The `Ldap` handle the stream drives its requests through.
    pub fn ldap_handle(&mut self) -> &mut Ldap {
        &mut self.ldap
    }
}

fn page_cookie(res: &LdapResult) -> Option<Vec<u8>> {
    res.ctrls
        .iter()
        .find(|ctrl| matches!(ctrl.kind, Some(ControlType::PagedResults)))
        .map(|ctrl| ctrl.raw.parse::<PagedResults>().cookie)
}

/// Collect the referral URIs out of a BER-encoded referral sequence.
/// Components that aren't UTF-8 octet strings are skipped.
pub fn parse_refs(t: StructureTag) -> Vec<String> {
    t.expect_constructed()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|uri| uri.expect_primitive())
        .filter_map(|uri| String::from_utf8(uri).ok())
        .collect()
}
