//! 9P protocol data types and constants.
//!
//! # Protocol
//! 9P2000

use std::fmt;

use bitflags::bitflags;
use enum_primitive::*;

/// 9P2000 version string
pub const VERSION9P: &str = "9P2000";

/// The version string that comes with `Rversion` when the server does not understand
/// the client's version string
pub const VERSION_UNKNOWN: &str = "unknown";

/*
 * 9P magic numbers
 */
/// Maximum number of elements or qids allowed in a single walk message
pub const MAXWELEM: usize = 16;

/// Ample room for `Twrite`/`Rread` header
///
/// size[4] Tread/Twrite[2] tag[2] fid[4] offset[8] count[4]
pub const IOHDRSZ: u32 = 24;

/// Largest encodable stat blob
pub const STATMAX: usize = (1 << 16) - 1;

/// Special tag which `Tversion`/`Rversion` must use as `tag`
pub const NOTAG: u16 = !0;

/// Special value which `Tattach` with no auth must use as `afid`
pub const NOFID: u32 = !0;

/// Dummy uid
pub const NOUID: u32 = !0;

/// Well-known 9P port
pub const P9_PORT: u16 = 564;

/*
 * Open modes. Only the low byte travels on the wire.
 */
/// Open for read
pub const OREAD: u16 = 0;
/// Write
pub const OWRITE: u16 = 1;
/// Read and write
pub const ORDWR: u16 = 2;
/// Execute, == read but check execute permission
pub const OEXEC: u16 = 3;
/// Or'ed in (except for exec), truncate file first
pub const OTRUNC: u16 = 16;
/// Or'ed in, close on exec
pub const OCEXEC: u16 = 32;
/// Or'ed in, remove on close
pub const ORCLOSE: u16 = 64;
/// Direct access
pub const ODIRECT: u16 = 128;
/// Non-blocking call
pub const ONONBLOCK: u16 = 256;
/// Exclusive use (create only)
pub const OEXCL: u16 = 0x1000;
/// Lock after opening
pub const OLOCK: u16 = 0x2000;
/// Append only
pub const OAPPEND: u16 = 0x4000;

/*
 * Access modes for `Fsys::access`
 */
/// Accessible: exists
pub const AEXIST: u8 = 0;
/// Execute access
pub const AEXEC: u8 = 1;
/// Write access
pub const AWRITE: u8 = 2;
/// Read access
pub const AREAD: u8 = 4;

/*
 * Bits in Dir.mode
 */
/// Mode bit for directories
pub const DMDIR: u32 = 0x80000000;
/// Mode bit for append only files
pub const DMAPPEND: u32 = 0x40000000;
/// Mode bit for exclusive use files
pub const DMEXCL: u32 = 0x20000000;
/// Mode bit for mounted channel
pub const DMMOUNT: u32 = 0x10000000;
/// Mode bit for authentication file
pub const DMAUTH: u32 = 0x08000000;
/// Mode bit for non-backed-up files
pub const DMTMP: u32 = 0x04000000;
/// Mode bit for symbolic links (9P2000.u)
pub const DMSYMLINK: u32 = 0x02000000;
/// Mode bit for hard links (9P2000.u)
pub const DMLINK: u32 = 0x01000000;
/// Mode bit for device files (9P2000.u)
pub const DMDEVICE: u32 = 0x00800000;
/// Mode bit for named pipes (9P2000.u)
pub const DMNAMEDPIPE: u32 = 0x00200000;
/// Mode bit for sockets (9P2000.u)
pub const DMSOCKET: u32 = 0x00100000;
/// Mode bit for setuid (9P2000.u)
pub const DMSETUID: u32 = 0x00080000;
/// Mode bit for setgid (9P2000.u)
pub const DMSETGID: u32 = 0x00040000;
/// Mode bit for read permission
pub const DMREAD: u32 = 0x4;
/// Mode bit for write permission
pub const DMWRITE: u32 = 0x2;
/// Mode bit for execute permission
pub const DMEXEC: u32 = 0x1;

bitflags! {
    /// Bits in Qid.typ
    ///
    /// # Protocol
    /// 9P2000/9P2000.u
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct QidType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for mounted channel"]
        const MOUNT     = 0x10;
        #[doc = "Type bit for authentication file"]
        const AUTH      = 0x08;
        #[doc = "Type bit for not-backed-up file"]
        const TMP       = 0x04;
        #[doc = "Type bits for symbolic links (9P2000.u)"]
        const SYMLINK   = 0x02;
        #[doc = "Type bits for hard-link (9P2000.u)"]
        const LINK      = 0x01;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

/// The server's unique identification for a file.
///
/// Two files on the same server are the same file iff their qids are equal.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Qid {
    /// Specify whether the file is a directory, append-only file, etc.
    pub typ: QidType,
    /// Version number for a file; typically, it is incremented every time the file is modified
    pub version: u32,
    /// An integer which is unique among all files in the hierarchy
    pub path: u64,
}

impl Qid {
    /// Encoded size: type[1] version[4] path[8]
    pub const SIZE: usize = 13;

    pub fn is_dir(&self) -> bool {
        self.typ.contains(QidType::DIR)
    }
}

impl fmt::Display for Qid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut t = String::new();
        if self.typ.contains(QidType::DIR) {
            t.push('d');
        }
        if self.typ.contains(QidType::APPEND) {
            t.push('a');
        }
        if self.typ.contains(QidType::EXCL) {
            t.push('l');
        }
        if self.typ.contains(QidType::AUTH) {
            t.push('A');
        }
        write!(f, "({:016x} {} {})", self.path, self.version, t)
    }
}

/// Permission and type bits of `Dir.mode`, rendered `ls -l` style.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Perm(pub u32);

impl Perm {
    pub fn is_dir(self) -> bool {
        self.0 & DMDIR != 0
    }
}

impl From<u32> for Perm {
    fn from(mode: u32) -> Self {
        Perm(mode)
    }
}

// A zero bit closes a group: the group prints '-' if none of its bits matched.
const PERM_CHARS: [(u32, char); 28] = [
    (DMDIR, 'd'),
    (DMAPPEND, 'a'),
    (DMAUTH, 'A'),
    (DMDEVICE, 'D'),
    (DMSOCKET, 'S'),
    (DMNAMEDPIPE, 'P'),
    (0, '-'),
    (DMEXCL, 'l'),
    (DMSYMLINK, 'L'),
    (0, '-'),
    (0o400, 'r'),
    (0, '-'),
    (0o200, 'w'),
    (0, '-'),
    (0o100, 'x'),
    (0, '-'),
    (0o040, 'r'),
    (0, '-'),
    (0o020, 'w'),
    (0, '-'),
    (0o010, 'x'),
    (0, '-'),
    (0o004, 'r'),
    (0, '-'),
    (0o002, 'w'),
    (0, '-'),
    (0o001, 'x'),
    (0, '-'),
];

impl fmt::Display for Perm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut did = false;
        for &(bit, c) in PERM_CHARS.iter() {
            if self.0 & bit != 0 {
                did = true;
                write!(f, "{}", c)?;
            }
            if bit == 0 {
                if !did {
                    write!(f, "{}", c)?;
                }
                did = false;
            }
        }
        Ok(())
    }
}

/// Plan 9 file metadata (somewhat like a unix fstat)
///
/// # Protocol
/// 9P2000
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Dir {
    /// Server type
    pub typ: u16,
    /// Server subtype
    pub dev: u32,
    /// Unique id from server
    pub qid: Qid,
    /// Permissions
    pub mode: Perm,
    /// Last read time
    pub atime: u32,
    /// Last write time
    pub mtime: u32,
    /// File length
    pub length: u64,
    /// Last element of path
    pub name: String,
    /// Owner name
    pub uid: String,
    /// Group name
    pub gid: String,
    /// Last modifier name
    pub muid: String,
}

impl Dir {
    /// The "don't touch" value for every field, as understood by `Twstat`.
    pub fn null() -> Dir {
        Dir {
            typ: !0,
            dev: !0,
            qid: Qid {
                typ: QidType::from_bits_retain(!0),
                version: !0,
                path: !0,
            },
            mode: Perm(!0),
            atime: !0,
            mtime: !0,
            length: !0,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
        }
    }

    /// Encoded size, excluding the leading size[2] field
    pub fn size(&self) -> usize {
        2 + 4
            + Qid::SIZE
            + 4
            + 4
            + 4
            + 8
            + (2 * 4)
            + self.name.len()
            + self.uid.len()
            + self.gid.len()
            + self.muid.len()
    }
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode.0 {
            0 => "0".to_owned(),
            m => format!("0{:o}", m),
        };
        write!(
            f,
            "'{}' '{}' '{}' '{}' q {} m {} at {} mt {} l {} t {} d {}",
            self.name,
            self.uid,
            self.gid,
            self.muid,
            self.qid,
            mode,
            self.atime,
            self.mtime,
            self.length,
            self.typ,
            self.dev
        )
    }
}

/// A partial `Dir` for `Twstat`: fields left `None` are sent as "don't touch".
///
/// The type, device and qid of a file cannot be changed by a client and are
/// always sent as "don't touch".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirUpdate {
    pub mode: Option<Perm>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
    pub length: Option<u64>,
    pub name: Option<String>,
    pub uid: Option<String>,
    pub gid: Option<String>,
    pub muid: Option<String>,
}

impl DirUpdate {
    pub fn to_dir(&self) -> Dir {
        let null = Dir::null();
        Dir {
            mode: self.mode.unwrap_or(null.mode),
            atime: self.atime.unwrap_or(null.atime),
            mtime: self.mtime.unwrap_or(null.mtime),
            length: self.length.unwrap_or(null.length),
            name: self.name.clone().unwrap_or(null.name),
            uid: self.uid.clone().unwrap_or(null.uid),
            gid: self.gid.clone().unwrap_or(null.gid),
            muid: self.muid.clone().unwrap_or(null.muid),
            ..null
        }
    }
}

impl From<DirUpdate> for Dir {
    fn from(update: DirUpdate) -> Self {
        update.to_dir()
    }
}

/// Data type used in `Rread` and `Twrite`
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

enum_from_primitive! {
    #[doc = "Message type, 9P operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum MsgType {
        Tversion        = 100,
        Rversion,
        Tauth           = 102,
        Rauth,
        Tattach         = 104,
        Rattach,
        Terror          = 106,  // Illegal, never used
        Rerror,
        Tflush          = 108,
        Rflush,
        Twalk           = 110,
        Rwalk,
        Topen           = 112,
        Ropen,
        Tcreate         = 114,
        Rcreate,
        Tread           = 116,
        Rread,
        Twrite          = 118,
        Rwrite,
        Tclunk          = 120,
        Rclunk,
        Tremove         = 122,
        Rremove,
        Tstat           = 124,
        Rstat,
        Twstat          = 126,
        Rwstat,
    }
}

impl MsgType {
    /// If the message type is T-message
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    /// If the message type is R-message
    pub fn is_r(&self) -> bool {
        (*self as u8) % 2 == 1
    }
}

impl<'a> From<&'a Fcall> for MsgType {
    fn from(fcall: &'a Fcall) -> MsgType {
        match *fcall {
            Fcall::Tversion { .. } => MsgType::Tversion,
            Fcall::Rversion { .. } => MsgType::Rversion,
            Fcall::Tauth { .. } => MsgType::Tauth,
            Fcall::Rauth { .. } => MsgType::Rauth,
            Fcall::Tattach { .. } => MsgType::Tattach,
            Fcall::Rattach { .. } => MsgType::Rattach,
            Fcall::Rerror { .. } => MsgType::Rerror,
            Fcall::Tflush { .. } => MsgType::Tflush,
            Fcall::Rflush => MsgType::Rflush,
            Fcall::Twalk { .. } => MsgType::Twalk,
            Fcall::Rwalk { .. } => MsgType::Rwalk,
            Fcall::Topen { .. } => MsgType::Topen,
            Fcall::Ropen { .. } => MsgType::Ropen,
            Fcall::Tcreate { .. } => MsgType::Tcreate,
            Fcall::Rcreate { .. } => MsgType::Rcreate,
            Fcall::Tread { .. } => MsgType::Tread,
            Fcall::Rread { .. } => MsgType::Rread,
            Fcall::Twrite { .. } => MsgType::Twrite,
            Fcall::Rwrite { .. } => MsgType::Rwrite,
            Fcall::Tclunk { .. } => MsgType::Tclunk,
            Fcall::Rclunk => MsgType::Rclunk,
            Fcall::Tremove { .. } => MsgType::Tremove,
            Fcall::Rremove => MsgType::Rremove,
            Fcall::Tstat { .. } => MsgType::Tstat,
            Fcall::Rstat { .. } => MsgType::Rstat,
            Fcall::Twstat { .. } => MsgType::Twstat,
            Fcall::Rwstat => MsgType::Rwstat,
        }
    }
}

/// A data type encapsulating the various 9P messages
///
/// The stat blobs of `Rstat`/`Twstat` are kept as raw bytes; see
/// [`Dir::from_bytes`](crate::fcall::Dir::from_bytes).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Fcall {
    Tversion {
        msize: u32,
        version: String,
    },
    Rversion {
        msize: u32,
        version: String,
    },
    Tauth {
        afid: u32,
        uname: String,
        aname: String,
    },
    Rauth {
        aqid: Qid,
    },
    Tattach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
    },
    Rattach {
        qid: Qid,
    },
    Rerror {
        ename: String,
    },
    Tflush {
        oldtag: u16,
    },
    Rflush,
    Twalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    Rwalk {
        wqids: Vec<Qid>,
    },
    Topen {
        fid: u32,
        mode: u8,
    },
    Ropen {
        qid: Qid,
        iounit: u32,
    },
    Tcreate {
        fid: u32,
        name: String,
        perm: Perm,
        mode: u8,
    },
    Rcreate {
        qid: Qid,
        iounit: u32,
    },
    Tread {
        fid: u32,
        offset: u64,
        count: u32,
    },
    Rread {
        data: Data,
    },
    Twrite {
        fid: u32,
        offset: u64,
        data: Data,
    },
    Rwrite {
        count: u32,
    },
    Tclunk {
        fid: u32,
    },
    Rclunk,
    Tremove {
        fid: u32,
    },
    Rremove,
    Tstat {
        fid: u32,
    },
    Rstat {
        stat: Vec<u8>,
    },
    Twstat {
        fid: u32,
        stat: Vec<u8>,
    },
    Rwstat,
}

/// Envelope for 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    /// Chosen and used by the client to identify the message.
    /// The reply to the message will have the same tag
    pub tag: u16,
    /// Message body encapsulating the various 9P messages
    pub body: Fcall,
}

/// Render at most 64 bytes of `b`, quoted if printable and in hex otherwise.
fn dumpsome(b: &[u8]) -> String {
    let b = &b[..b.len().min(64)];
    let printable = b
        .iter()
        .all(|&c| (c == 0 || c == b'\n' || c == b'\t' || c >= b' ') && c <= 127);

    if printable {
        format!("{:?}", String::from_utf8_lossy(b))
    } else {
        b.iter().map(|c| format!("{:02x}", c)).collect()
    }
}

fn fmt_stat(stat: &[u8]) -> String {
    match Dir::from_bytes(stat) {
        Ok(d) => format!("stat {}", d),
        Err(_) => format!("stat({} bytes)", stat.len()),
    }
}

impl fmt::Display for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use crate::Fcall::*;

        let tag = self.tag;
        match self.body {
            Tversion { msize, ref version } => {
                write!(f, "Tversion tag {} msize {} version '{}'", tag, msize, version)
            }
            Rversion { msize, ref version } => {
                write!(f, "Rversion tag {} msize {} version '{}'", tag, msize, version)
            }
            Tauth { afid, ref uname, ref aname } => write!(
                f,
                "Tauth tag {} afid {} uname {} aname {}",
                tag, afid, uname, aname
            ),
            Rauth { aqid } => write!(f, "Rauth tag {} qid {}", tag, aqid),
            Tattach { fid, afid, ref uname, ref aname } => write!(
                f,
                "Tattach tag {} fid {} afid {} uname {} aname {}",
                tag, fid, afid, uname, aname
            ),
            Rattach { qid } => write!(f, "Rattach tag {} qid {}", tag, qid),
            Rerror { ref ename } => write!(f, "Rerror tag {} ename {}", tag, ename),
            Tflush { oldtag } => write!(f, "Tflush tag {} oldtag {}", tag, oldtag),
            Rflush => write!(f, "Rflush tag {}", tag),
            Twalk { fid, newfid, ref wnames } => write!(
                f,
                "Twalk tag {} fid {} newfid {} wname {:?}",
                tag, fid, newfid, wnames
            ),
            Rwalk { ref wqids } => {
                write!(f, "Rwalk tag {} wqid [", tag)?;
                for (i, q) in wqids.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", q)?;
                }
                write!(f, "]")
            }
            Topen { fid, mode } => write!(f, "Topen tag {} fid {} mode {}", tag, fid, mode),
            Ropen { qid, iounit } => {
                write!(f, "Ropen tag {} qid {} iounit {}", tag, qid, iounit)
            }
            Tcreate { fid, ref name, perm, mode } => write!(
                f,
                "Tcreate tag {} fid {} name {} perm {} mode {}",
                tag, fid, name, perm, mode
            ),
            Rcreate { qid, iounit } => {
                write!(f, "Rcreate tag {} qid {} iounit {}", tag, qid, iounit)
            }
            Tread { fid, offset, count } => write!(
                f,
                "Tread tag {} fid {} offset {} count {}",
                tag, fid, offset, count
            ),
            Rread { ref data } => write!(
                f,
                "Rread tag {} count {} {}",
                tag,
                data.0.len(),
                dumpsome(&data.0)
            ),
            Twrite { fid, offset, ref data } => write!(
                f,
                "Twrite tag {} fid {} offset {} count {} {}",
                tag,
                fid,
                offset,
                data.0.len(),
                dumpsome(&data.0)
            ),
            Rwrite { count } => write!(f, "Rwrite tag {} count {}", tag, count),
            Tclunk { fid } => write!(f, "Tclunk tag {} fid {}", tag, fid),
            Rclunk => write!(f, "Rclunk tag {}", tag),
            Tremove { fid } => write!(f, "Tremove tag {} fid {}", tag, fid),
            Rremove => write!(f, "Rremove tag {}", tag),
            Tstat { fid } => write!(f, "Tstat tag {} fid {}", tag, fid),
            Rstat { ref stat } => write!(f, "Rstat tag {} {}", tag, fmt_stat(stat)),
            Twstat { fid, ref stat } => {
                write!(f, "Twstat tag {} fid {} {}", tag, fid, fmt_stat(stat))
            }
            Rwstat => write!(f, "Rwstat tag {}", tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perm_string() {
        assert_eq!(Perm(0o644).to_string(), "--rw-r--r--");
        assert_eq!(Perm(DMDIR | 0o755).to_string(), "d-rwxr-xr-x");
        assert_eq!(Perm(DMAPPEND | DMEXCL | 0o600).to_string(), "alrw-------");
        assert_eq!(Perm(DMSYMLINK | 0o777).to_string(), "-Lrwxrwxrwx");
        assert_eq!(Perm(0).to_string(), "-----------");
    }

    #[test]
    fn perm_string_stacks_type_bits() {
        // Every set bit in a group prints; the placeholder only stands in for an empty group.
        assert_eq!(Perm(DMDIR | DMAUTH).to_string(), "dA----------");
    }

    #[test]
    fn qid_string() {
        let qid = Qid {
            typ: QidType::DIR | QidType::APPEND,
            version: 7,
            path: 0x2a,
        };
        assert_eq!(qid.to_string(), "(000000000000002a 7 da)");
        assert!(qid.is_dir());
    }

    #[test]
    fn dir_string() {
        let mut d = Dir {
            name: "motd".to_owned(),
            uid: "glenda".to_owned(),
            gid: "sys".to_owned(),
            length: 42,
            ..Default::default()
        };
        assert_eq!(
            d.to_string(),
            "'motd' 'glenda' 'sys' '' q (0000000000000000 0 ) m 0 at 0 mt 0 l 42 t 0 d 0"
        );
        d.mode = Perm(0o644);
        assert!(d.to_string().contains(" m 0644 "));
    }

    #[test]
    fn msg_type_direction() {
        assert!(MsgType::Tversion.is_t());
        assert!(MsgType::Rerror.is_r());
        assert!(MsgType::Rwstat.is_r());
        assert!(MsgType::Twalk.is_t());
        assert_eq!(MsgType::from(&Fcall::Rflush), MsgType::Rflush);
    }

    #[test]
    fn dir_update_leaves_untouched_fields_null() {
        let update = DirUpdate {
            name: Some("foo".to_owned()),
            ..Default::default()
        };
        let d = update.to_dir();
        let null = Dir::null();
        assert_eq!(d.name, "foo");
        assert_eq!(d.mode, null.mode);
        assert_eq!(d.atime, !0);
        assert_eq!(d.mtime, !0);
        assert_eq!(d.length, !0);
        assert_eq!(d.qid, null.qid);
        assert!(d.uid.is_empty() && d.gid.is_empty() && d.muid.is_empty());
    }

    #[test]
    fn dumpsome_quotes_or_hexes() {
        assert_eq!(dumpsome(b"hello\n"), "\"hello\\n\"");
        assert_eq!(dumpsome(&[0xff, 0x01]), "ff01");
        assert_eq!(dumpsome(&[b'a'; 100]).len(), 64 + 2);
    }
}
