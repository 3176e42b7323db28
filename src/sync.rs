use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;

use crate::conn::{LdapConnSettings, LdapConnection};
use crate::controls_impl::IntoControlList;
use crate::exop::Exop;
use crate::ldap::{Ldap, Mod};
use crate::result::{CompareResult, ExopResult, LdapResult, Result, SearchResult};
use crate::search::{ResultEntry, SearchOptions, SearchStream, StreamState};
use crate::RequestId;

use tokio::runtime::{self, Runtime};

/// Blocking facade over the asynchronous client.
///
/// One struct bundles a single-threaded Tokio runtime, the spawned
/// connection, and an operation handle; every method here simply blocks
/// on its asynchronous counterpart, so the two surfaces stay in lockstep.
/// Unlike [`Ldap`](struct.Ldap.html), `LdapConn` can't be cloned; a
/// second handle means a second connection.
#[cfg_attr(docsrs, doc(cfg(feature = "sync")))]
#[derive(Debug)]
pub struct LdapConn {
    rt: Runtime,
    ldap: Ldap,
}

impl LdapConn {
    /// Open a connection to an LDAP server specified by `url`.
    ///
    /// See [`LdapConnection`](struct.LdapConnection.html) for the
    /// supported URL formats and the connection lifecycle.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_settings(LdapConnSettings::new(), url)
    }

    /// Open a connection to an LDAP server specified by `url`, using
    /// `settings` to specify additional parameters.
    pub fn with_settings(settings: LdapConnSettings, url: &str) -> Result<Self> {
        Self::multi_with_settings(settings, &[url])
    }

    /// Open a failover connection across several server URLs, with
    /// additional settings.
    pub fn multi_with_settings(settings: LdapConnSettings, urls: &[&str]) -> Result<Self> {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (conn, ldap) = LdapConnection::multi_with_settings(settings, urls)?;
        rt.block_on(async move {
            super::drive!(conn);
        });
        Ok(LdapConn { ldap, rt })
    }

    /// See [`Ldap::with_controls()`](struct.Ldap.html#method.with_controls).
    pub fn with_controls<V: IntoControlList>(&mut self, ctrls: V) -> &mut Self {
        self.ldap.controls = Some(ctrls.into_list());
        self
    }

    /// See [`Ldap::with_timeout()`](struct.Ldap.html#method.with_timeout).
    pub fn with_timeout(&mut self, duration: Duration) -> &mut Self {
        self.ldap.timeout = Some(duration);
        self
    }

    /// See [`Ldap::simple_bind()`](struct.Ldap.html#method.simple_bind).
    pub fn simple_bind(&mut self, bind_dn: &str, bind_pw: &str) -> Result<LdapResult> {
        let rt = &mut self.rt;
        let ldap = &mut self.ldap;
        rt.block_on(async move { ldap.simple_bind(bind_dn, bind_pw).await })
    }

    /// See [`Ldap::search()`](struct.Ldap.html#method.search).
    pub fn search(&mut self, base: &str, opts: SearchOptions) -> Result<SearchResult> {
        let rt = &mut self.rt;
        let ldap = &mut self.ldap;
        rt.block_on(async move { ldap.search(base, opts).await })
    }

    /// Start a Search whose entries are pulled one at a time through the
    /// returned [`EntryStream`](struct.EntryStream.html), instead of
    /// being gathered like `search()` does.
    pub fn streaming_search<'b>(
        &'b mut self,
        base: &str,
        opts: SearchOptions,
    ) -> Result<EntryStream<'b>> {
        let rt = &mut self.rt;
        let ldap = &mut self.ldap;
        let stream = rt.block_on(async move { ldap.streaming_search(base, opts).await })?;
        Ok(EntryStream { stream, conn: self })
    }

    /// See [`Ldap::add()`](struct.Ldap.html#method.add).
    pub fn add<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        attrs: Vec<(S, HashSet<S>)>,
    ) -> Result<LdapResult> {
        let rt = &mut self.rt;
        let ldap = &mut self.ldap;
        rt.block_on(async move { ldap.add(dn, attrs).await })
    }

    /// See [`Ldap::compare()`](struct.Ldap.html#method.compare).
    pub fn compare<B: AsRef<[u8]>>(
        &mut self,
        dn: &str,
        attr: &str,
        val: B,
    ) -> Result<CompareResult> {
        let rt = &mut self.rt;
        let ldap = &mut self.ldap;
        rt.block_on(async move { ldap.compare(dn, attr, val).await })
    }

    /// See [`Ldap::delete()`](struct.Ldap.html#method.delete).
    pub fn delete(&mut self, dn: &str) -> Result<LdapResult> {
        let rt = &mut self.rt;
        let ldap = &mut self.ldap;
        rt.block_on(async move { ldap.delete(dn).await })
    }

    /// See [`Ldap::modify()`](struct.Ldap.html#method.modify).
    pub fn modify<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        mods: Vec<Mod<S>>,
    ) -> Result<LdapResult> {
        let rt = &mut self.rt;
        let ldap = &mut self.ldap;
        rt.block_on(async move { ldap.modify(dn, mods).await })
    }

    /// See [`Ldap::modifydn()`](struct.Ldap.html#method.modifydn).
    pub fn modifydn(
        &mut self,
        dn: &str,
        rdn: &str,
        delete_old: bool,
        new_sup: Option<&str>,
    ) -> Result<LdapResult> {
        let rt = &mut self.rt;
        let ldap = &mut self.ldap;
        rt.block_on(async move { ldap.modifydn(dn, rdn, delete_old, new_sup).await })
    }

    /// See [`Ldap::rename()`](struct.Ldap.html#method.rename).
    pub fn rename(&mut self, dn: &str, new_dn: &str) -> Result<LdapResult> {
        let rt = &mut self.rt;
        let ldap = &mut self.ldap;
        rt.block_on(async move { ldap.rename(dn, new_dn).await })
    }

    /// See [`Ldap::unbind()`](struct.Ldap.html#method.unbind).
    pub fn unbind(&mut self) -> Result<()> {
        let rt = &mut self.rt;
        let ldap = &mut self.ldap;
        rt.block_on(async move { ldap.unbind().await })
    }

    /// See [`Ldap::extended()`](struct.Ldap.html#method.extended).
    pub fn extended<E>(&mut self, exop: E) -> Result<ExopResult>
    where
        E: Into<Exop>,
    {
        let rt = &mut self.rt;
        let ldap = &mut self.ldap;
        rt.block_on(async move { ldap.extended(exop).await })
    }

    /// See [`Ldap::last_id()`](struct.Ldap.html#method.last_id).
    pub fn last_id(&mut self) -> RequestId {
        self.ldap.last_id()
    }

    /// See [`Ldap::abandon()`](struct.Ldap.html#method.abandon).
    pub fn abandon(&mut self, msgid: RequestId) -> Result<()> {
        let rt = &mut self.rt;
        let ldap = &mut self.ldap;
        rt.block_on(async move { ldap.abandon(msgid).await })
    }

    /// See [`Ldap::destroy()`](struct.Ldap.html#method.destroy).
    pub fn destroy(&mut self) -> Result<()> {
        let rt = &mut self.rt;
        let ldap = &mut self.ldap;
        rt.block_on(async move { ldap.destroy().await })
    }

    /// See [`Ldap::is_closed()`](struct.Ldap.html#method.is_closed).
    pub fn is_closed(&mut self) -> bool {
        self.ldap.is_closed()
    }
}

/// Blocking counterpart of [`SearchStream`](struct.SearchStream.html),
/// produced by
/// [`streaming_search()`](struct.LdapConn.html#method.streaming_search).
///
/// It drives the inner stream on the runtime of the `LdapConn` it came
/// from, which is why it holds that connection exclusively borrowed: the
/// connection can't be used for anything else until the stream is done.
#[cfg_attr(docsrs, doc(cfg(feature = "sync")))]
pub struct EntryStream<'b> {
    stream: SearchStream,
    conn: &'b mut LdapConn,
}

impl<'b> EntryStream<'b> {
    /// See [`SearchStream::next()`](struct.SearchStream.html#method.next).
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<ResultEntry>> {
        let rt = &mut self.conn.rt;
        let stream = &mut self.stream;
        rt.block_on(async move { stream.next().await })
    }

    /// See [`SearchStream::resume_with()`](struct.SearchStream.html#method.resume_with).
    pub fn resume_with(&mut self, stop: bool) -> Result<()> {
        let rt = &mut self.conn.rt;
        let stream = &mut self.stream;
        rt.block_on(async move { stream.resume_with(stop).await })
    }

    /// Consume the stream and return the search's overall result; see
    /// [`SearchStream::finish()`](struct.SearchStream.html#method.finish).
    pub fn result(mut self) -> LdapResult {
        let rt = &mut self.conn.rt;
        let stream = &mut self.stream;
        rt.block_on(async move { stream.finish().await })
    }

    /// See [`SearchStream::state()`](struct.SearchStream.html#method.state).
    pub fn state(&self) -> StreamState {
        self.stream.state()
    }

    /// The message ID of the stream's most recent Search request, for
    /// abandoning an interrupted search.
    pub fn last_id(&mut self) -> RequestId {
        self.stream.ldap_handle().last_id()
    }
}
