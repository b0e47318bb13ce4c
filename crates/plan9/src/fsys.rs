//! Path-based operations on an attached file tree.

use crate::{fcall::*, fid::Fid, utils::Result};

/// Open modes probed by `access`, indexed by `AREAD|AWRITE|AEXEC` bits.
const ACCESS_OMODE: [u16; 8] = [
    0,
    OEXEC,
    OWRITE,
    ORDWR,
    OREAD,
    OEXEC, // only approximate
    ORDWR,
    ORDWR, // only approximate
];

/// A file tree attached on a connection, rooted at one fid.
///
/// Paths are walked from the root; fids made along the way are clunked
/// before returning, except for the one handed out by `open`/`create`.
#[derive(Debug)]
pub struct Fsys {
    root: Fid,
}

impl Fsys {
    pub(crate) fn new(root: Fid) -> Fsys {
        Fsys { root }
    }

    pub fn root(&self) -> &Fid {
        &self.root
    }

    /// Walk to `name` and open it with `mode`.
    pub async fn open(&self, name: &str, mode: u16) -> Result<Fid> {
        let mut fid = self.root.walk(name).await?;
        if let Err(e) = fid.open(mode).await {
            let _ = fid.close().await;
            return Err(e);
        }
        Ok(fid)
    }

    /// Create `name`, or truncate it if it exists, and open it with `mode`.
    ///
    /// Everything up to the last `/` must already exist. A set `DMDIR` bit
    /// in `perm` makes a directory.
    pub async fn create<P: Into<Perm>>(&self, name: &str, mode: u16, perm: P) -> Result<Fid> {
        let (dir, elem) = name.rsplit_once('/').unwrap_or(("", name));
        let mut fid = self.root.walk(dir).await?;
        if let Err(e) = fid.create(elem, mode, perm).await {
            let _ = fid.close().await;
            return Err(e);
        }
        Ok(fid)
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        self.root.walk(name).await?.remove().await
    }

    pub async fn stat(&self, name: &str) -> Result<Dir> {
        let fid = self.root.walk(name).await?;
        let dir = fid.stat().await;
        let _ = fid.close().await;
        dir
    }

    pub async fn wstat(&self, name: &str, update: &DirUpdate) -> Result<()> {
        let fid = self.root.walk(name).await?;
        let result = fid.wstat(update).await;
        let _ = fid.close().await;
        result
    }

    /// Check that `name` can be used as `mode` (some of `AREAD`, `AWRITE`,
    /// `AEXEC`, or `AEXIST`) by opening it and closing it again.
    pub async fn access(&self, name: &str, mode: u8) -> Result<()> {
        if mode == AEXIST {
            return self.stat(name).await.map(|_| ());
        }
        let fid = self.open(name, ACCESS_OMODE[(mode & 7) as usize]).await?;
        let _ = fid.close().await;
        Ok(())
    }

    /// Clunk the root fid. The connection stays up.
    pub async fn close(self) -> Result<()> {
        self.root.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_table() {
        assert_eq!(ACCESS_OMODE[AEXEC as usize], OEXEC);
        assert_eq!(ACCESS_OMODE[AWRITE as usize], OWRITE);
        assert_eq!(ACCESS_OMODE[AREAD as usize], OREAD);
        assert_eq!(ACCESS_OMODE[(AREAD | AWRITE) as usize], ORDWR);
        assert_eq!(ACCESS_OMODE[(AREAD | AEXEC) as usize], OEXEC);
        assert_eq!(ACCESS_OMODE[(AREAD | AWRITE | AEXEC) as usize], ORDWR);
    }
}
