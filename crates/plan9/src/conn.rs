//! Client side of a 9P connection.
//!
//! A [`Conn`] owns one byte stream. Any number of tasks may issue requests
//! through it at once; each request gets its own tag, and a single receive
//! loop hands every reply to the task waiting on that tag.

use {
    crate::{
        error::Error,
        fcall::*,
        fid::{Fid, Lease},
        fsys::Fsys,
        pool::IdPool,
        proto_err, res, serialize,
        utils::Result,
    },
    bytes::{BufMut, Bytes, BytesMut},
    futures::sink::SinkExt,
    log::{debug, error, info, warn},
    std::{
        collections::HashMap,
        fmt,
        future::Future,
        sync::{
            Arc, MutexGuard, PoisonError,
            atomic::{AtomicU32, AtomicU64, Ordering},
        },
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        runtime::Handle,
        sync::{Mutex, oneshot},
        task::JoinHandle,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
};

type Reply = Result<Fcall>;
type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LengthDelimitedCodec>;

/// Parameters of the version handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Largest message, size prefix included, the client is willing to handle.
    pub msize: u32,
    pub version: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            msize: 128 * 1024,
            version: VERSION9P.to_owned(),
        }
    }
}

struct MuxState {
    tags: IdPool<u16>,
    pending: HashMap<u16, oneshot::Sender<Reply>>,
    /// Set once; the reason every later request fails with.
    hungup: Option<String>,
    versioning: bool,
}

/// Table of outstanding transactions, shared with the receive loop.
struct Mux {
    state: std::sync::Mutex<MuxState>,
}

impl Mux {
    fn new() -> Mux {
        Mux {
            state: std::sync::Mutex::new(MuxState {
                tags: IdPool::new(),
                pending: HashMap::new(),
                hungup: None,
                versioning: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self) -> Result<(u16, oneshot::Receiver<Reply>)> {
        let mut state = self.lock();
        if let Some(ref reason) = state.hungup {
            return res!(Error::Hungup(reason.clone()));
        }
        if state.versioning {
            return res!(proto_err!("version handshake in progress"));
        }
        let tag = state.tags.alloc()?;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(tag, tx);
        Ok((tag, rx))
    }

    fn register_notag(&self) -> Result<(u16, oneshot::Receiver<Reply>)> {
        let mut state = self.lock();
        if let Some(ref reason) = state.hungup {
            return res!(Error::Hungup(reason.clone()));
        }
        if state.versioning {
            return res!(proto_err!("version handshake in progress"));
        }
        let outstanding = state.tags.in_use();
        if outstanding > 0 {
            return res!(proto_err!(
                "version with {} transactions outstanding",
                outstanding
            ));
        }
        state.versioning = true;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(NOTAG, tx);
        Ok((NOTAG, rx))
    }

    fn deliver(&self, msg: Msg) {
        let waiter = self.lock().pending.remove(&msg.tag);
        match waiter {
            // The waiter may have given up; its tag stays reserved until it is flushed.
            Some(tx) => {
                let _ = tx.send(Ok(msg.body));
            }
            None => warn!("reply with unknown tag dropped: {}", msg),
        }
    }

    fn is_pending(&self, tag: u16) -> bool {
        self.lock().pending.contains_key(&tag)
    }

    /// Finish the transaction on `tag` and make the tag available again.
    fn release(&self, tag: u16) {
        let mut state = self.lock();
        state.pending.remove(&tag);
        if tag == NOTAG {
            state.versioning = false;
        } else {
            state.tags.free(tag);
        }
    }

    /// Stop waiting on `tag` without an `Rflush`.
    ///
    /// If the server has not answered yet the tag stays allocated, and a late
    /// reply on it is dropped as unknown.
    fn abandon(&self, tag: u16) {
        let mut state = self.lock();
        let unanswered = state.pending.remove(&tag).is_some();
        if tag == NOTAG {
            state.versioning = false;
        } else if unanswered {
            warn!("tag {} retired without Rflush", tag);
        } else {
            state.tags.free(tag);
        }
    }

    /// Mark the connection dead and fail every waiter exactly once.
    fn hangup(&self, reason: &str) -> bool {
        let mut state = self.lock();
        if state.hungup.is_some() {
            return false;
        }
        state.hungup = Some(reason.to_owned());
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(Err(Error::Hungup(reason.to_owned())));
        }
        true
    }

    fn hungup(&self) -> Option<String> {
        self.lock().hungup.clone()
    }

    fn outstanding(&self) -> usize {
        self.lock().tags.in_use()
    }
}

async fn recv_loop<R>(mux: Arc<Mux>, mut framedread: FramedRead<R, LengthDelimitedCodec>)
where
    R: AsyncRead + Send + Unpin,
{
    let reason = loop {
        let bytes = match framedread.next().await {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => break format!("read: {}", e),
            None => break "eof".to_owned(),
        };

        match serialize::read_msg(&bytes) {
            Ok(msg) => {
                debug!("\t← {}", msg);
                mux.deliver(msg);
            }
            // The tag of a frame that does not decode cannot be trusted.
            Err(e) => break e.to_string(),
        }
    };

    if mux.hangup(&reason) {
        error!("connection hung up: {}", reason);
    }
}

struct Inner {
    mux: Arc<Mux>,
    writer: Mutex<Writer>,
    fids: std::sync::Mutex<IdPool<u32>>,
    /// Upper bound for the frame codec; no handshake may propose more.
    max_msize: u32,
    msize: AtomicU32,
    version: std::sync::Mutex<String>,
    session: AtomicU64,
    reader: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// A 9P connection, cheap to clone and shared by every `Fid` made from it.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<Inner>,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("msize", &self.msize())
            .field("outstanding", &self.outstanding())
            .field("hungup", &self.inner.mux.hungup())
            .finish()
    }
}

/// An rpc between registering its tag and finishing.
///
/// Dropped before the reply arrived, it flushes the tag in the background so
/// the tag is not reused while the server may still answer on it.
struct Pending<'a> {
    conn: &'a Conn,
    tag: u16,
    typ: MsgType,
    sent: bool,
    done: bool,
}

impl Pending<'_> {
    fn finish(mut self) {
        self.done = true;
        self.conn.inner.mux.release(self.tag);
    }

    /// Give up on a tag whose flush failed.
    fn abandon(mut self) {
        self.done = true;
        self.conn.inner.mux.abandon(self.tag);
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mux = &self.conn.inner.mux;
        if !self.sent || self.tag == NOTAG || !mux.is_pending(self.tag) {
            mux.release(self.tag);
            return;
        }

        let conn = self.conn.clone();
        let tag = self.tag;
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match conn.flush(tag).await {
                        Ok(()) => conn.inner.mux.release(tag),
                        Err(e) => {
                            debug!("flush of abandoned tag {}: {}", tag, e);
                            conn.inner.mux.abandon(tag);
                        }
                    }
                });
            }
            Err(_) => warn!("tag {} abandoned with no runtime to flush it", tag),
        }
    }
}

fn check(sent: MsgType, reply: Fcall) -> Result<Fcall> {
    match reply {
        Fcall::Rerror { ename } => res!(Error::Remote(ename)),
        reply if MsgType::from(&reply) as u8 == sent as u8 + 1 => Ok(reply),
        reply => res!(Error::UnexpectedReply {
            sent,
            got: MsgType::from(&reply),
        }),
    }
}

fn closed() -> Error {
    Error::Hungup("receive loop exited".to_owned())
}

impl Conn {
    /// Negotiate a session over `stream` with the default [`Config`].
    pub async fn new<S>(stream: S) -> Result<Conn>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Conn::with_config(stream, Config::default()).await
    }

    /// Start the receive loop on `stream` and perform the version handshake.
    pub async fn with_config<S>(stream: S, config: Config) -> Result<Conn>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (readhalf, writehalf) = tokio::io::split(stream);
        let framedread = FramedRead::new(readhalf, serialize::codec(config.msize as usize));
        let writehalf: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writehalf);
        let framedwrite = FramedWrite::new(writehalf, serialize::codec(config.msize as usize));

        let mux = Arc::new(Mux::new());
        let reader = tokio::spawn(recv_loop(mux.clone(), framedread));

        let conn = Conn {
            inner: Arc::new(Inner {
                mux,
                writer: Mutex::new(framedwrite),
                fids: std::sync::Mutex::new(IdPool::new()),
                max_msize: config.msize,
                msize: AtomicU32::new(config.msize),
                version: std::sync::Mutex::new(String::new()),
                session: AtomicU64::new(0),
                reader,
            }),
        };
        conn.version(config.msize, &config.version).await?;
        Ok(conn)
    }

    /// Start a new session.
    ///
    /// Refused while any transaction is outstanding. Fids made in earlier
    /// sessions stop working; their numbers are only returned locally.
    pub async fn version(&self, msize: u32, version: &str) -> Result<u32> {
        if msize > self.inner.max_msize {
            return res!(proto_err!(
                "msize {} exceeds the connection limit {}",
                msize,
                self.inner.max_msize
            ));
        }

        let tx = Fcall::Tversion {
            msize,
            version: version.to_owned(),
        };
        let (rmsize, rversion) = match self.rpc(tx).await? {
            Fcall::Rversion { msize, version } => (msize, version),
            other => return res!(unexpected(MsgType::Tversion, &other)),
        };

        if rversion != VERSION9P {
            return res!(proto_err!("server speaks {:?}, not {}", rversion, VERSION9P));
        }
        if rmsize > msize {
            return res!(proto_err!(
                "server msize {} exceeds proposed {}",
                rmsize,
                msize
            ));
        }
        if rmsize <= IOHDRSZ {
            return res!(proto_err!("server msize {} too small", rmsize));
        }

        self.inner.msize.store(rmsize, Ordering::SeqCst);
        *self
            .inner
            .version
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = rversion;
        let session = self.inner.session.fetch_add(1, Ordering::SeqCst) + 1;
        info!("session {}: version {} msize {}", session, VERSION9P, rmsize);
        Ok(rmsize)
    }

    /// Send `tx` and wait for its reply.
    ///
    /// `Rerror` comes back as [`Error::Remote`]; a reply of the wrong type as
    /// [`Error::UnexpectedReply`]. Neither affects the connection.
    pub async fn rpc(&self, tx: Fcall) -> Result<Fcall> {
        let (pending, rx) = self.start(tx).await?;
        let reply = rx.await;
        let typ = pending.typ;
        pending.finish();
        check(typ, reply.map_err(|_| closed())??)
    }

    /// Like [`rpc`](Conn::rpc), but give up when `cancel` completes first.
    ///
    /// Giving up flushes the request and waits for `Rflush`. If the server
    /// answered the request before the flush, that answer is returned;
    /// otherwise the result is [`Error::Flushed`].
    pub async fn rpc_until<F: Future>(&self, tx: Fcall, cancel: F) -> Result<Fcall> {
        let (pending, mut rx) = self.start(tx).await?;

        let reply = tokio::select! {
            biased;
            reply = &mut rx => Some(reply),
            _ = cancel => None,
        };

        let reply = match reply {
            Some(reply) => reply.map_err(|_| closed())?,
            None => {
                if let Err(e) = self.flush(pending.tag).await {
                    // Without Rflush the tag is only safe to reuse if its reply came in.
                    return match rx.try_recv() {
                        Ok(reply) => {
                            let typ = pending.typ;
                            pending.finish();
                            check(typ, reply?)
                        }
                        Err(_) => {
                            pending.abandon();
                            Err(e)
                        }
                    };
                }
                match rx.try_recv() {
                    Ok(reply) => reply,
                    Err(oneshot::error::TryRecvError::Empty) => Err(Error::Flushed),
                    Err(oneshot::error::TryRecvError::Closed) => Err(closed()),
                }
            }
        };

        let typ = pending.typ;
        pending.finish();
        check(typ, reply?)
    }

    async fn flush(&self, oldtag: u16) -> Result<()> {
        debug!("flushing tag {}", oldtag);
        self.rpc(Fcall::Tflush { oldtag }).await.map(|_| ())
    }

    async fn start(&self, tx: Fcall) -> Result<(Pending<'_>, oneshot::Receiver<Reply>)> {
        let (tag, rx) = match tx {
            Fcall::Tversion { .. } => self.inner.mux.register_notag()?,
            _ => self.inner.mux.register()?,
        };
        let mut pending = Pending {
            conn: self,
            tag,
            typ: MsgType::from(&tx),
            sent: false,
            done: false,
        };

        let msg = Msg { tag, body: tx };
        let mut writer = BytesMut::with_capacity(64).writer();
        serialize::write_msg(&mut writer, &msg)?;
        let frozen = writer.into_inner().freeze();
        if frozen.len() + 4 > self.msize() as usize {
            return res!(proto_err!(
                "{:?} of {} bytes exceeds msize {}",
                pending.typ,
                frozen.len() + 4,
                self.msize()
            ));
        }

        debug!("\t→ {}", msg);
        {
            let mut framedwrite = self.inner.writer.lock().await;
            pending.sent = true;
            if let Err(e) = framedwrite.send(frozen).await {
                let reason = format!("write: {}", e);
                if self.inner.mux.hangup(&reason) {
                    error!("connection hung up: {}", reason);
                }
                return res!(e);
            }
        }

        Ok((pending, rx))
    }

    /// Authenticate `uname` for `aname`; the returned fid carries the
    /// authentication conversation.
    pub async fn auth(&self, uname: &str, aname: &str) -> Result<Fid> {
        let lease = Lease::alloc(self)?;
        let tx = Fcall::Tauth {
            afid: lease.fid(),
            uname: uname.to_owned(),
            aname: aname.to_owned(),
        };
        match self.rpc(tx).await? {
            Fcall::Rauth { aqid } => Ok(Fid::new(self.clone(), lease.keep(), aqid)),
            other => res!(unexpected(MsgType::Tauth, &other)),
        }
    }

    /// Attach to the file tree `aname` as `uname`.
    ///
    /// `afid` is a fid that completed authentication, or `None` to attach
    /// without it.
    pub async fn attach(&self, afid: Option<&Fid>, uname: &str, aname: &str) -> Result<Fsys> {
        let lease = Lease::alloc(self)?;
        let tx = Fcall::Tattach {
            fid: lease.fid(),
            afid: afid.map_or(NOFID, Fid::fid),
            uname: uname.to_owned(),
            aname: aname.to_owned(),
        };
        match self.rpc(tx).await? {
            Fcall::Rattach { qid } => {
                let fid = Fid::new(self.clone(), lease.keep(), qid);
                Ok(Fsys::new(fid))
            }
            other => res!(unexpected(MsgType::Tattach, &other)),
        }
    }

    /// Shut the connection down. Every outstanding and later request fails
    /// with [`Error::Hungup`].
    pub async fn close(&self) {
        if self.inner.mux.hangup("closed") {
            info!("connection closed");
        }
        let mut framedwrite = self.inner.writer.lock().await;
        if let Err(e) = SinkExt::<Bytes>::close(&mut *framedwrite).await {
            debug!("close: {}", e);
        }
        self.inner.reader.abort();
    }

    /// Negotiated maximum message size.
    pub fn msize(&self) -> u32 {
        self.inner.msize.load(Ordering::SeqCst)
    }

    /// Negotiated protocol version.
    pub fn version_string(&self) -> String {
        self.inner
            .version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of tags in use, including tags waiting for `Rflush`.
    pub fn outstanding(&self) -> usize {
        self.inner.mux.outstanding()
    }

    pub fn is_hungup(&self) -> bool {
        self.inner.mux.hungup().is_some()
    }

    pub(crate) fn session(&self) -> u64 {
        self.inner.session.load(Ordering::SeqCst)
    }

    pub(crate) fn alloc_fid(&self) -> Result<u32> {
        self.fids().alloc()
    }

    pub(crate) fn free_fid(&self, fid: u32) {
        self.fids().free(fid)
    }

    fn fids(&self) -> MutexGuard<'_, IdPool<u32>> {
        self.inner
            .fids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn unexpected(sent: MsgType, got: &Fcall) -> Error {
    Error::UnexpectedReply {
        sent,
        got: MsgType::from(got),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replies_must_match_requests() {
        assert!(check(MsgType::Tclunk, Fcall::Rclunk).is_ok());
        assert!(matches!(
            check(MsgType::Tclunk, Fcall::Rremove),
            Err(Error::UnexpectedReply {
                sent: MsgType::Tclunk,
                got: MsgType::Rremove
            })
        ));
        assert!(matches!(
            check(MsgType::Topen, Fcall::Rerror { ename: "no".into() }),
            Err(Error::Remote(ref e)) if e == "no"
        ));
    }

    #[test]
    fn hangup_fails_every_waiter_once() {
        let mux = Mux::new();
        let (a, mut rx_a) = mux.register().unwrap();
        let (b, mut rx_b) = mux.register().unwrap();
        assert_ne!(a, b);

        assert!(mux.hangup("boom"));
        assert!(!mux.hangup("again"));
        assert!(matches!(rx_a.try_recv(), Ok(Err(Error::Hungup(ref r))) if r == "boom"));
        assert!(matches!(rx_b.try_recv(), Ok(Err(Error::Hungup(_)))));
        assert!(matches!(mux.register(), Err(Error::Hungup(_))));
    }

    #[test]
    fn version_needs_a_quiet_connection() {
        let mux = Mux::new();
        let (tag, _rx) = mux.register().unwrap();
        assert!(matches!(mux.register_notag(), Err(Error::Protocol(_))));

        mux.release(tag);
        let (notag, _rx) = mux.register_notag().unwrap();
        assert_eq!(notag, NOTAG);
        assert!(mux.register().is_err());
        assert!(mux.register_notag().is_err());

        mux.release(NOTAG);
        assert!(mux.register().is_ok());
    }

    #[test]
    fn abandoned_tag_stays_reserved_until_answered() {
        let mux = Mux::new();
        let (unanswered, _rx) = mux.register().unwrap();
        mux.abandon(unanswered);
        assert_eq!(mux.outstanding(), 1);
        assert!(!mux.is_pending(unanswered));
        let (next, _rx) = mux.register().unwrap();
        assert_ne!(next, unanswered);

        mux.deliver(Msg {
            tag: next,
            body: Fcall::Rclunk,
        });
        mux.abandon(next);
        assert_eq!(mux.outstanding(), 1);
    }

    #[tokio::test]
    async fn request_dropped_before_sending_is_not_flushed() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let (r, w) = tokio::io::split(server);
        let mut srx = FramedRead::new(r, serialize::codec(1 << 16));
        let mut stx = FramedWrite::new(w, serialize::codec(1 << 16));
        let handshake = async {
            let bytes = srx.next().await.unwrap().unwrap();
            let m = serialize::read_msg(&bytes).unwrap();
            let reply = Msg {
                tag: m.tag,
                body: Fcall::Rversion {
                    msize: 8192,
                    version: VERSION9P.to_owned(),
                },
            };
            let mut buf = Vec::new();
            serialize::write_msg(&mut buf, &reply).unwrap();
            stx.send(Bytes::from(buf)).await.unwrap();
        };
        let (conn, _) = tokio::join!(Conn::new(client), handshake);
        let conn = conn.unwrap();

        let writer = conn.inner.writer.lock().await;
        let c = conn.clone();
        let task = tokio::spawn(async move { c.rpc(Fcall::Tclunk { fid: 1 }).await });
        while conn.outstanding() == 0 {
            tokio::task::yield_now().await;
        }
        task.abort();
        let _ = task.await;
        drop(writer);
        assert_eq!(conn.outstanding(), 0);

        // No Tflush goes out ahead of the next request.
        let c = conn.clone();
        let _next = tokio::spawn(async move { c.rpc(Fcall::Tclunk { fid: 2 }).await });
        let bytes = srx.next().await.unwrap().unwrap();
        let m = serialize::read_msg(&bytes).unwrap();
        assert_eq!(m.body, Fcall::Tclunk { fid: 2 });
    }

    #[test]
    fn unknown_tags_are_dropped() {
        let mux = Mux::new();
        let (tag, mut rx) = mux.register().unwrap();
        mux.deliver(Msg {
            tag: tag + 1,
            body: Fcall::Rclunk,
        });
        assert!(rx.try_recv().is_err());
        assert!(mux.is_pending(tag));

        mux.deliver(Msg {
            tag,
            body: Fcall::Rclunk,
        });
        assert!(matches!(rx.try_recv(), Ok(Ok(Fcall::Rclunk))));
        assert!(!mux.is_pending(tag));
        // Delivery alone does not free the tag.
        assert_eq!(mux.outstanding(), 1);
        mux.release(tag);
        assert_eq!(mux.outstanding(), 0);
    }
}
