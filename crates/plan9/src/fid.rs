//! Client handle on a server fid.

use {
    crate::{
        conn::{Conn, unexpected},
        error::Error,
        fcall::*,
        proto_err, res,
        serialize::unpack_dirs,
        utils::Result,
    },
    log::{debug, warn},
    std::{fmt, io, io::SeekFrom},
    tokio::runtime::Handle,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Bound,
    Open { mode: u16, iounit: u32 },
}

/// A fid number leased from a [`Conn`], with the qid it last resolved to.
///
/// Dropping a `Fid` without [`clunk`](Fid::clunk) or [`remove`](Fid::remove)
/// clunks it in the background.
pub struct Fid {
    conn: Conn,
    fid: u32,
    qid: Qid,
    state: State,
    /// Position for `read`, `write` and `seek`.
    offset: u64,
    session: u64,
    released: bool,
}

impl fmt::Debug for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fid")
            .field("fid", &self.fid)
            .field("qid", &self.qid)
            .field("state", &self.state)
            .field("offset", &self.offset)
            .finish()
    }
}

impl Fid {
    pub(crate) fn new(conn: Conn, fid: u32, qid: Qid) -> Fid {
        let session = conn.session();
        Fid {
            conn,
            fid,
            qid,
            state: State::Bound,
            offset: 0,
            session,
            released: false,
        }
    }

    pub fn fid(&self) -> u32 {
        self.fid
    }

    pub fn qid(&self) -> Qid {
        self.qid
    }

    pub fn conn(&self) -> &Conn {
        &self.conn
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open { .. })
    }

    /// The mode the fid was opened or created with.
    pub fn mode(&self) -> Option<u16> {
        match self.state {
            State::Open { mode, .. } => Some(mode),
            State::Bound => None,
        }
    }

    /// Largest read or write that goes out as a single message.
    pub fn iounit(&self) -> u32 {
        let max = self.conn.msize().saturating_sub(IOHDRSZ);
        match self.state {
            State::Open { iounit, .. } if iounit != 0 => iounit.min(max),
            _ => max,
        }
    }

    fn check(&self) -> Result<()> {
        if self.session != self.conn.session() {
            return res!(proto_err!(
                "fid {} belongs to an earlier session",
                self.fid
            ));
        }
        Ok(())
    }

    /// Walk to `path`, relative to this fid, and return a fid for the result.
    ///
    /// Empty and `.` elements are skipped; an empty path clones the fid.
    /// Paths longer than `MAXWELEM` elements take several `Twalk`s.
    pub async fn walk(&self, path: &str) -> Result<Fid> {
        let names: Vec<&str> = path
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();
        self.walk_names(&names).await
    }

    pub async fn walk_names(&self, names: &[&str]) -> Result<Fid> {
        self.check()?;
        let mut lease = Lease::alloc(&self.conn)?;
        let newfid = lease.fid;

        let chunks: Vec<&[&str]> = if names.is_empty() {
            vec![names]
        } else {
            names.chunks(MAXWELEM).collect()
        };

        let mut qid = self.qid;
        for chunk in chunks {
            let tx = Fcall::Twalk {
                fid: if lease.bound { newfid } else { self.fid },
                newfid,
                wnames: chunk.iter().map(|s| s.to_string()).collect(),
            };
            let err = match self.conn.rpc(tx).await {
                Ok(Fcall::Rwalk { wqids }) if wqids.len() == chunk.len() => {
                    if let Some(last) = wqids.last() {
                        qid = *last;
                    }
                    lease.bound = true;
                    continue;
                }
                Ok(Fcall::Rwalk { wqids }) if wqids.len() < chunk.len() => {
                    Error::NotFound(chunk[wqids.len()].to_owned())
                }
                Ok(Fcall::Rwalk { wqids }) => {
                    // The server claims more than was asked; newfid may exist.
                    lease.bound = true;
                    proto_err!("{} qids for {} names", wqids.len(), chunk.len())
                }
                Ok(other) => unexpected(MsgType::Twalk, &other),
                Err(e) => e,
            };

            if lease.bound && !self.conn.is_hungup() {
                if let Err(e) = self.conn.rpc(Fcall::Tclunk { fid: newfid }).await {
                    warn!("clunk of partially walked fid {}: {}", newfid, e);
                }
            }
            lease.bound = false;
            return Err(err);
        }

        Ok(Fid::new(self.conn.clone(), lease.keep(), qid))
    }

    /// Open the file for I/O.
    ///
    /// `mode` is one of `OREAD`, `OWRITE`, `ORDWR`, `OEXEC`, possibly or'ed
    /// with `OTRUNC`, `OCEXEC`, `ORCLOSE` or `OAPPEND`. Only the low byte is
    /// sent; `OAPPEND` makes [`write`](Fid::write) go to the end of file.
    pub async fn open(&mut self, mode: u16) -> Result<()> {
        self.check()?;
        let tx = Fcall::Topen {
            fid: self.fid,
            mode: mode as u8,
        };
        match self.conn.rpc(tx).await? {
            Fcall::Ropen { qid, iounit } => {
                self.opened(qid, mode, iounit);
                Ok(())
            }
            other => res!(unexpected(MsgType::Topen, &other)),
        }
    }

    /// Create `name` in the directory this fid refers to; on success the fid
    /// refers to the new file, opened with `mode`.
    ///
    /// The file may have been created even when an error is returned.
    pub async fn create<P: Into<Perm>>(&mut self, name: &str, mode: u16, perm: P) -> Result<()> {
        self.check()?;
        let tx = Fcall::Tcreate {
            fid: self.fid,
            name: name.to_owned(),
            perm: perm.into(),
            mode: mode as u8,
        };
        match self.conn.rpc(tx).await? {
            Fcall::Rcreate { qid, iounit } => {
                self.opened(qid, mode, iounit);
                Ok(())
            }
            other => res!(unexpected(MsgType::Tcreate, &other)),
        }
    }

    fn opened(&mut self, qid: Qid, mode: u16, iounit: u32) {
        self.qid = qid;
        self.state = State::Open { mode, iounit };
        self.offset = 0;
    }

    /// Read at most one message worth of data at `offset`.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.check()?;
        let count = buf.len().min(self.iounit() as usize);
        let tx = Fcall::Tread {
            fid: self.fid,
            offset,
            count: count as u32,
        };
        match self.conn.rpc(tx).await? {
            Fcall::Rread { data } => {
                let n = data.0.len();
                if n > count {
                    return res!(proto_err!("read returned {} bytes, asked {}", n, count));
                }
                buf[..n].copy_from_slice(&data.0);
                Ok(n)
            }
            other => res!(unexpected(MsgType::Tread, &other)),
        }
    }

    /// Write `buf` at `offset`, one message per `iounit` bytes.
    ///
    /// Stops at the first short write and returns the total written.
    pub async fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.check()?;
        let max = (self.iounit() as usize).max(1);
        let mut total = 0;
        loop {
            let chunk = &buf[total..buf.len().min(total + max)];
            let tx = Fcall::Twrite {
                fid: self.fid,
                offset: offset + total as u64,
                data: Data(chunk.to_vec()),
            };
            let count = match self.conn.rpc(tx).await? {
                Fcall::Rwrite { count } => count as usize,
                other => return res!(unexpected(MsgType::Twrite, &other)),
            };
            if count > chunk.len() {
                return res!(proto_err!(
                    "write returned {} bytes, sent {}",
                    count,
                    chunk.len()
                ));
            }
            total += count;
            if count < chunk.len() || total == buf.len() {
                return Ok(total);
            }
        }
    }

    /// Read from the current position and advance it.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.read_at(buf, self.offset).await?;
        self.offset += n as u64;
        Ok(n)
    }

    /// Write at the current position and advance it.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.mode().is_some_and(|mode| mode & OAPPEND != 0) {
            self.offset = self.stat().await?.length;
        }
        let n = self.write_at(buf, self.offset).await?;
        self.offset += n as u64;
        Ok(n)
    }

    /// Read until end of file, appending to `buf`.
    pub async fn read_to_end(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        let mut chunk = vec![0; self.iounit() as usize];
        let mut total = 0;
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            buf.extend_from_slice(&chunk[..n]);
            total += n;
        }
    }

    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let offset = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(d) => self.offset.checked_add_signed(d),
            SeekFrom::End(d) => self.stat().await?.length.checked_add_signed(d),
        };
        self.offset = offset.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative offset")
        })?;
        Ok(self.offset)
    }

    /// Read the next batch of directory entries; empty at the end.
    pub async fn dirread(&mut self) -> Result<Vec<Dir>> {
        let mut buf = vec![0; self.iounit() as usize];
        let n = self.read(&mut buf).await?;
        unpack_dirs(&buf[..n])
    }

    /// Read every remaining directory entry.
    pub async fn dirreadall(&mut self) -> Result<Vec<Dir>> {
        let mut buf = Vec::new();
        self.read_to_end(&mut buf).await?;
        unpack_dirs(&buf)
    }

    pub async fn stat(&self) -> Result<Dir> {
        self.check()?;
        match self.conn.rpc(Fcall::Tstat { fid: self.fid }).await? {
            Fcall::Rstat { stat } => Dir::from_bytes(&stat),
            other => res!(unexpected(MsgType::Tstat, &other)),
        }
    }

    /// Change the fields of the file's metadata that `update` sets.
    pub async fn wstat(&self, update: &DirUpdate) -> Result<()> {
        self.check()?;
        let tx = Fcall::Twstat {
            fid: self.fid,
            stat: update.to_dir().to_bytes()?,
        };
        self.conn.rpc(tx).await.map(|_| ())
    }

    /// Release the fid. The number is returned to the pool even if the
    /// server reports an error.
    pub async fn clunk(self) -> Result<()> {
        self.release(|fid| Fcall::Tclunk { fid }).await
    }

    /// Same as [`clunk`](Fid::clunk).
    pub async fn close(self) -> Result<()> {
        self.clunk().await
    }

    /// Remove the file and release the fid, which is gone whatever the
    /// server answers.
    pub async fn remove(self) -> Result<()> {
        self.release(|fid| Fcall::Tremove { fid }).await
    }

    async fn release(mut self, tx: impl FnOnce(u32) -> Fcall) -> Result<()> {
        self.released = true;
        // Frees the number however this future ends.
        let _lease = Lease::new(self.conn.clone(), self.fid);
        match self.check() {
            Ok(()) => self.conn.rpc(tx(self.fid)).await.map(|_| ()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Fid {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut lease = Lease::new(self.conn.clone(), self.fid);
        lease.bound = self.check().is_ok();
    }
}

/// A fid number taken from the connection's pool.
///
/// Dropped without [`keep`](Lease::keep), the number goes back to the pool,
/// after a background clunk if the fid is bound on the server.
pub(crate) struct Lease {
    conn: Conn,
    fid: u32,
    /// Whether the fid exists on the server.
    bound: bool,
    kept: bool,
}

impl Lease {
    pub(crate) fn alloc(conn: &Conn) -> Result<Lease> {
        let fid = conn.alloc_fid()?;
        Ok(Lease::new(conn.clone(), fid))
    }

    fn new(conn: Conn, fid: u32) -> Lease {
        Lease {
            conn,
            fid,
            bound: false,
            kept: false,
        }
    }

    pub(crate) fn fid(&self) -> u32 {
        self.fid
    }

    /// Hand the number over to a [`Fid`].
    pub(crate) fn keep(mut self) -> u32 {
        self.kept = true;
        self.fid
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        if !self.bound || self.conn.is_hungup() {
            self.conn.free_fid(self.fid);
            return;
        }

        let conn = self.conn.clone();
        let fid = self.fid;
        match Handle::try_current() {
            Ok(handle) => {
                debug!("clunking dropped fid {}", fid);
                handle.spawn(async move {
                    if let Err(e) = conn.rpc(Fcall::Tclunk { fid }).await {
                        warn!("clunk of dropped fid {}: {}", fid, e);
                    }
                    conn.free_fid(fid);
                });
            }
            Err(_) => {
                warn!("fid {} dropped with no runtime to clunk it", fid);
                self.conn.free_fid(fid);
            }
        }
    }
}
