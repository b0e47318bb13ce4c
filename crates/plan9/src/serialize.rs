//! Serialize/deserialize 9P messages into/from binary.
//!
//! Every decode step returns a `Result`; a malformed frame is reported as
//! [`Error::Protocol`] and never panics.

use crate::{error::Error, fcall::*, proto_err, res, utils::Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::mem;
use std::ops::Shl;
use tokio_util::codec::LengthDelimitedCodec;

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };
}

fn short(_: std::io::Error) -> Error {
    proto_err!("short message")
}

fn read_exact(r: &mut &[u8], size: usize) -> Result<Vec<u8>> {
    if r.len() < size {
        return res!(proto_err!("short message: want {} bytes, have {}", size, r.len()));
    }
    let (head, tail) = r.split_at(size);
    *r = tail;
    Ok(head.to_vec())
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, ?
pub struct SResult<T>(Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable + ?Sized>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<W: WriteBytesExt> SResult<Encoder<W>> {
    fn written(self) -> Result<usize> {
        self.0.map(|enc| enc.bytes_written())
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for str {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let len = u16::try_from(self.len()).map_err(|_| proto_err!("string too long"))?;
        if self.contains('\0') {
            return res!(proto_err!("NUL in string"));
        }
        let mut bytes = len.encode(w)?;
        w.write_all(self.as_bytes())?;
        bytes += self.len();
        Ok(bytes)
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.as_str().encode(w)
    }
}

impl Encodable for QidType {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.bits().encode(w)
    }
}

impl Encodable for Qid {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (Encoder::new(w) << &self.typ << &self.version << &self.path).written()
    }
}

impl Encodable for Perm {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.0.encode(w)
    }
}

impl Encodable for Dir {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        // The blob, size[2] included, must itself fit a stat[n] field.
        if self.size() + 2 > STATMAX {
            return res!(proto_err!("stat too big: {} bytes", self.size() + 2));
        }
        let size = self.size() as u16;
        (Encoder::new(w)
            << &size
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid)
            .written()
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = u32::try_from(self.0.len()).map_err(|_| proto_err!("data too long"))?;
        let bytes = size.encode(w)?;
        w.write_all(&self.0)?;
        Ok(bytes + self.0.len())
    }
}

/// count[2] followed by the elements; a `Vec<u8>` is a stat blob.
impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let len = u16::try_from(self.len()).map_err(|_| proto_err!("too many elements"))?;
        self.iter()
            .fold(Encoder::new(w) << &len, |acc, s| acc << s)
            .written()
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::Fcall::*;

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            Tversion {
                ref msize,
                ref version,
            } => buf << msize << version,
            Rversion {
                ref msize,
                ref version,
            } => buf << msize << version,
            Tauth {
                ref afid,
                ref uname,
                ref aname,
            } => buf << afid << uname << aname,
            Rauth { ref aqid } => buf << aqid,
            Tattach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => buf << fid << afid << uname << aname,
            Rattach { ref qid } => buf << qid,
            Rerror { ref ename } => buf << ename,
            Tflush { ref oldtag } => buf << oldtag,
            Rflush => buf,
            Twalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => {
                if wnames.len() > MAXWELEM {
                    return res!(proto_err!("too many names in walk"));
                }
                buf << fid << newfid << wnames
            }
            Rwalk { ref wqids } => {
                if wqids.len() > MAXWELEM {
                    return res!(proto_err!("too many qids in walk"));
                }
                buf << wqids
            }
            Topen { ref fid, ref mode } => buf << fid << mode,
            Ropen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            Tcreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
            } => buf << fid << name << perm << mode,
            Rcreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            Tread {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            Rread { ref data } => buf << data,
            Twrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            Rwrite { ref count } => buf << count,
            Tclunk { ref fid } => buf << fid,
            Rclunk => buf,
            Tremove { ref fid } => buf << fid,
            Rremove => buf,
            Tstat { ref fid } => buf << fid,
            Rstat { ref stat } => buf << stat,
            Twstat { ref fid, ref stat } => buf << fid << stat,
            Rwstat => buf,
        };

        buf.written()
    }
}

/// Trait representing a type which can be deserialized from binary
///
/// Decoding consumes from the front of the slice.
pub trait Decodable: Sized {
    fn decode(r: &mut &[u8]) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode(r: &mut &[u8]) -> Result<Self> {
        r.read_u8().map_err(short)
    }
}

impl Decodable for u16 {
    fn decode(r: &mut &[u8]) -> Result<Self> {
        r.read_u16::<LittleEndian>().map_err(short)
    }
}

impl Decodable for u32 {
    fn decode(r: &mut &[u8]) -> Result<Self> {
        r.read_u32::<LittleEndian>().map_err(short)
    }
}

impl Decodable for u64 {
    fn decode(r: &mut &[u8]) -> Result<Self> {
        r.read_u64::<LittleEndian>().map_err(short)
    }
}

impl Decodable for String {
    fn decode(r: &mut &[u8]) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let s = String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| proto_err!("invalid UTF-8 sequence"))?;
        if s.contains('\0') {
            return res!(proto_err!("NUL in string {:?}", s));
        }
        Ok(s)
    }
}

impl Decodable for Qid {
    fn decode(r: &mut &[u8]) -> Result<Self> {
        Ok(Qid {
            typ: QidType::from_bits_retain(decode!(*r)),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Perm {
    fn decode(r: &mut &[u8]) -> Result<Self> {
        Ok(Perm(decode!(*r)))
    }
}

impl Decodable for Dir {
    fn decode(r: &mut &[u8]) -> Result<Self> {
        let size: u16 = Decodable::decode(r)?;
        let body = read_exact(r, size as usize)?;
        let mut b = &body[..];
        let dir = Dir {
            typ: decode!(b),
            dev: decode!(b),
            qid: decode!(b),
            mode: decode!(b),
            atime: decode!(b),
            mtime: decode!(b),
            length: decode!(b),
            name: decode!(b),
            uid: decode!(b),
            gid: decode!(b),
            muid: decode!(b),
        };
        if !b.is_empty() {
            return res!(proto_err!("malformed Dir: {} trailing bytes", b.len()));
        }
        Ok(dir)
    }
}

impl Decodable for Data {
    fn decode(r: &mut &[u8]) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode(r: &mut &[u8]) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::with_capacity((len as usize).min(r.len()));
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

/// Decode the element list of a walk, refusing more than `MAXWELEM` entries.
fn decode_walk<T: Decodable>(r: &mut &[u8]) -> Result<Vec<T>> {
    let mut peek = *r;
    let n: u16 = Decodable::decode(&mut peek)?;
    if n as usize > MAXWELEM {
        return res!(proto_err!("{} walk elements exceeds {}", n, MAXWELEM));
    }
    Decodable::decode(r)
}

impl Decodable for Msg {
    fn decode(r: &mut &[u8]) -> Result<Self> {
        use crate::MsgType::*;

        let buf = r;

        let typ: u8 = decode!(*buf);
        let tag = decode!(*buf);
        let body = match MsgType::from_u8(typ) {
            Some(Tversion) => Fcall::Tversion {
                msize: decode!(*buf),
                version: decode!(*buf),
            },
            Some(Rversion) => Fcall::Rversion {
                msize: decode!(*buf),
                version: decode!(*buf),
            },
            Some(Tauth) => Fcall::Tauth {
                afid: decode!(*buf),
                uname: decode!(*buf),
                aname: decode!(*buf),
            },
            Some(Rauth) => Fcall::Rauth { aqid: decode!(*buf) },
            Some(Tattach) => Fcall::Tattach {
                fid: decode!(*buf),
                afid: decode!(*buf),
                uname: decode!(*buf),
                aname: decode!(*buf),
            },
            Some(Rattach) => Fcall::Rattach { qid: decode!(*buf) },
            Some(Rerror) => Fcall::Rerror {
                ename: decode!(*buf),
            },
            Some(Tflush) => Fcall::Tflush {
                oldtag: decode!(*buf),
            },
            Some(Rflush) => Fcall::Rflush,
            Some(Twalk) => Fcall::Twalk {
                fid: decode!(*buf),
                newfid: decode!(*buf),
                wnames: decode_walk(buf)?,
            },
            Some(Rwalk) => Fcall::Rwalk {
                wqids: decode_walk(buf)?,
            },
            Some(Topen) => Fcall::Topen {
                fid: decode!(*buf),
                mode: decode!(*buf),
            },
            Some(Ropen) => Fcall::Ropen {
                qid: decode!(*buf),
                iounit: decode!(*buf),
            },
            Some(Tcreate) => Fcall::Tcreate {
                fid: decode!(*buf),
                name: decode!(*buf),
                perm: decode!(*buf),
                mode: decode!(*buf),
            },
            Some(Rcreate) => Fcall::Rcreate {
                qid: decode!(*buf),
                iounit: decode!(*buf),
            },
            Some(Tread) => Fcall::Tread {
                fid: decode!(*buf),
                offset: decode!(*buf),
                count: decode!(*buf),
            },
            Some(Rread) => Fcall::Rread { data: decode!(*buf) },
            Some(Twrite) => Fcall::Twrite {
                fid: decode!(*buf),
                offset: decode!(*buf),
                data: decode!(*buf),
            },
            Some(Rwrite) => Fcall::Rwrite {
                count: decode!(*buf),
            },
            Some(Tclunk) => Fcall::Tclunk { fid: decode!(*buf) },
            Some(Rclunk) => Fcall::Rclunk,
            Some(Tremove) => Fcall::Tremove { fid: decode!(*buf) },
            Some(Rremove) => Fcall::Rremove,
            Some(Tstat) => Fcall::Tstat { fid: decode!(*buf) },
            Some(Rstat) => Fcall::Rstat { stat: decode!(*buf) },
            Some(Twstat) => Fcall::Twstat {
                fid: decode!(*buf),
                stat: decode!(*buf),
            },
            Some(Rwstat) => Fcall::Rwstat,
            Some(Terror) | None => return res!(proto_err!("invalid message type {}", typ)),
        };

        Ok(Msg { tag, body })
    }
}

/// Decode a message body (everything after size[4]); the body must be consumed exactly.
pub fn read_msg(mut b: &[u8]) -> Result<Msg> {
    let msg: Msg = Decodable::decode(&mut b)?;
    if !b.is_empty() {
        return res!(proto_err!(
            "malformed {:?}: {} trailing bytes",
            MsgType::from(&msg.body),
            b.len()
        ));
    }
    Ok(msg)
}

/// Encode a message body (everything after size[4]) into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

/// Encode a complete frame, size prefix included.
pub fn encode_frame(msg: &Msg) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; 4];
    write_msg(&mut buf, msg)?;
    let size = u32::try_from(buf.len()).map_err(|_| proto_err!("message too long"))?;
    LittleEndian::write_u32(&mut buf[..4], size);
    Ok(buf)
}

/// Decode a complete frame, checking the size prefix against the actual length.
pub fn decode_frame(b: &[u8]) -> Result<Msg> {
    if b.len() < 4 {
        return res!(proto_err!("short frame"));
    }
    let size = LittleEndian::read_u32(&b[..4]);
    if size as usize != b.len() {
        return res!(proto_err!(
            "size prefix {} disagrees with frame length {}",
            size,
            b.len()
        ));
    }
    read_msg(&b[4..])
}

/// Framing for a 9P byte stream: size[4] little-endian, counting itself.
///
/// The codec strips the prefix on read and adds it on write, so frames pass
/// through [`read_msg`]/[`write_msg`].
pub fn codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .max_frame_length(max_frame_length)
        .new_codec()
}

impl Dir {
    /// Encode as a stat blob, size[2] included.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size() + 2);
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode a single stat blob; the blob must hold exactly one entry.
    pub fn from_bytes(mut b: &[u8]) -> Result<Dir> {
        let dir: Dir = Decodable::decode(&mut b)?;
        if !b.is_empty() {
            return res!(proto_err!("malformed Dir: {} trailing bytes", b.len()));
        }
        Ok(dir)
    }
}

/// Decode the concatenated entries returned by reading a directory.
pub fn unpack_dirs(mut b: &[u8]) -> Result<Vec<Dir>> {
    let mut dirs = Vec::new();
    while !b.is_empty() {
        dirs.push(Decodable::decode(&mut b)?);
    }
    Ok(dirs)
}

#[cfg(test)]
fn all_messages() -> Vec<Fcall> {
    let qid = Qid {
        typ: QidType::DIR,
        version: 3,
        path: 0x0102030405060708,
    };
    let stat = Dir {
        typ: 'M' as u16,
        dev: 4,
        qid,
        mode: Perm(DMDIR | 0o775),
        atime: 1_700_000_000,
        mtime: 1_700_000_001,
        length: 0,
        name: "glenda".to_owned(),
        uid: "glenda".to_owned(),
        gid: "sys".to_owned(),
        muid: "bootes".to_owned(),
    }
    .to_bytes()
    .unwrap();

    vec![
        Fcall::Tversion {
            msize: 8192,
            version: VERSION9P.to_owned(),
        },
        Fcall::Rversion {
            msize: 8192,
            version: VERSION9P.to_owned(),
        },
        Fcall::Tauth {
            afid: 9,
            uname: "glenda".to_owned(),
            aname: String::new(),
        },
        Fcall::Rauth {
            aqid: Qid {
                typ: QidType::AUTH,
                ..qid
            },
        },
        Fcall::Tattach {
            fid: 0,
            afid: NOFID,
            uname: "glenda".to_owned(),
            aname: "main".to_owned(),
        },
        Fcall::Rattach { qid },
        Fcall::Rerror {
            ename: "permission denied".to_owned(),
        },
        Fcall::Tflush { oldtag: 3 },
        Fcall::Rflush,
        Fcall::Twalk {
            fid: 0,
            newfid: 1,
            wnames: (0..MAXWELEM).map(|i| format!("d{}", i)).collect(),
        },
        Fcall::Rwalk {
            wqids: vec![qid; MAXWELEM],
        },
        Fcall::Topen { fid: 1, mode: 0x12 },
        Fcall::Ropen { qid, iounit: 0 },
        Fcall::Tcreate {
            fid: 1,
            name: "new".to_owned(),
            perm: Perm(0o644),
            mode: 1,
        },
        Fcall::Rcreate { qid, iounit: 8168 },
        Fcall::Tread {
            fid: 1,
            offset: 1 << 40,
            count: 8168,
        },
        Fcall::Rread {
            data: Data(b"hello, world\n".to_vec()),
        },
        Fcall::Twrite {
            fid: 1,
            offset: 7,
            data: Data(vec![0, 1, 2, 255]),
        },
        Fcall::Rwrite { count: 4 },
        Fcall::Tclunk { fid: 1 },
        Fcall::Rclunk,
        Fcall::Tremove { fid: 1 },
        Fcall::Rremove,
        Fcall::Tstat { fid: 1 },
        Fcall::Rstat { stat: stat.clone() },
        Fcall::Twstat { fid: 1, stat },
        Fcall::Rwstat,
    ]
}

#[cfg(test)]
fn frame(typ: u8, tag: u16, body: &[u8]) -> Vec<u8> {
    let mut b = Vec::new();
    b.extend_from_slice(&((body.len() + 7) as u32).to_le_bytes());
    b.push(typ);
    b.extend_from_slice(&tag.to_le_bytes());
    b.extend_from_slice(body);
    b
}

#[test]
fn encoder_test1() {
    let expected: Vec<u8> = (0..10).collect();
    let mut encoder = Vec::new();
    for i in 0..10 {
        (i as u8).encode(&mut encoder).unwrap();
    }
    assert_eq!(expected, encoder);
}

#[test]
fn integers_are_little_endian() {
    let mut buf = Vec::new();
    let n = (Encoder::new(&mut buf) << &0x0102u16 << &0x03040506u32 << &0x0708090a0b0c0d0eu64)
        .written()
        .unwrap();
    assert_eq!(n, 14);
    assert_eq!(
        buf,
        [2, 1, 6, 5, 4, 3, 0x0e, 0x0d, 0x0c, 0x0b, 0x0a, 9, 8, 7]
    );
}

#[test]
fn twalk_frame_bytes() {
    let msg = Msg {
        tag: 5,
        body: Fcall::Twalk {
            fid: 1,
            newfid: 2,
            wnames: vec!["usr".to_owned(), "glenda".to_owned()],
        },
    };
    let expected: Vec<u8> = vec![
        30, 0, 0, 0, // size
        110, // Twalk
        5, 0, // tag
        1, 0, 0, 0, // fid
        2, 0, 0, 0, // newfid
        2, 0, // nwname
        3, 0, b'u', b's', b'r', //
        6, 0, b'g', b'l', b'e', b'n', b'd', b'a',
    ];
    assert_eq!(encode_frame(&msg).unwrap(), expected);
    assert_eq!(decode_frame(&expected).unwrap(), msg);
}

#[test]
fn qid_encodes_type_first() {
    let qid = Qid {
        typ: QidType::DIR,
        version: 1,
        path: 2,
    };
    let mut buf = Vec::new();
    assert_eq!(qid.encode(&mut buf).unwrap(), Qid::SIZE);
    assert_eq!(buf, [0x80, 1, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn every_message_round_trips() {
    for (tag, body) in all_messages().into_iter().enumerate() {
        let msg = Msg {
            tag: tag as u16,
            body,
        };
        let b = encode_frame(&msg).unwrap();
        assert_eq!(b.len(), u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize);
        assert_eq!(decode_frame(&b).unwrap(), msg, "{}", msg);
    }
}

#[test]
fn string_too_long_is_protocol_error() {
    let msg = Msg {
        tag: NOTAG,
        body: Fcall::Tversion {
            msize: 8192,
            version: "b".repeat(1 << 16),
        },
    };
    assert!(matches!(encode_frame(&msg), Err(Error::Protocol(_))));

    let fits = Msg {
        tag: NOTAG,
        body: Fcall::Rerror {
            ename: "e".repeat((1 << 16) - 1),
        },
    };
    assert!(encode_frame(&fits).is_ok());
}

#[test]
fn nul_in_string_is_protocol_error() {
    let msg = Msg {
        tag: 1,
        body: Fcall::Tcreate {
            fid: 1,
            name: "a\0b".to_owned(),
            perm: Perm(0o644),
            mode: 0,
        },
    };
    assert!(matches!(encode_frame(&msg), Err(Error::Protocol(_))));

    let b = frame(MsgType::Rerror as u8, 1, &[3, 0, b'a', 0, b'b']);
    assert!(matches!(decode_frame(&b), Err(Error::Protocol(_))));
}

#[test]
fn too_many_walk_elements() {
    let walk = Msg {
        tag: 1,
        body: Fcall::Twalk {
            fid: 0,
            newfid: 1,
            wnames: vec!["a".to_owned(); MAXWELEM + 1],
        },
    };
    assert!(matches!(encode_frame(&walk), Err(Error::Protocol(_))));

    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes());
    body.extend_from_slice(&1u32.to_le_bytes());
    body.extend_from_slice(&17u16.to_le_bytes());
    for _ in 0..17 {
        body.extend_from_slice(&[1, 0, b'a']);
    }
    let b = frame(MsgType::Twalk as u8, 1, &body);
    assert!(matches!(decode_frame(&b), Err(Error::Protocol(_))));

    let mut body = Vec::new();
    body.extend_from_slice(&17u16.to_le_bytes());
    body.extend_from_slice(&[0u8; 17 * Qid::SIZE]);
    let b = frame(MsgType::Rwalk as u8, 1, &body);
    assert!(matches!(decode_frame(&b), Err(Error::Protocol(_))));
}

#[test]
fn size_prefix_must_match() {
    let msg = Msg {
        tag: 2,
        body: Fcall::Tclunk { fid: 7 },
    };
    let mut b = encode_frame(&msg).unwrap();
    b.push(0);
    assert!(matches!(decode_frame(&b), Err(Error::Protocol(_))));

    let mut b = encode_frame(&msg).unwrap();
    b.pop();
    assert!(matches!(decode_frame(&b), Err(Error::Protocol(_))));

    assert!(decode_frame(&[1, 0]).is_err());
}

#[test]
fn trailing_and_short_bodies_are_rejected() {
    // Tclunk with a stray byte after fid[4]; the prefix agrees with the length.
    let b = frame(MsgType::Tclunk as u8, 1, &[7, 0, 0, 0, 0]);
    assert!(matches!(decode_frame(&b), Err(Error::Protocol(_))));

    // Rread claiming ten bytes of data but carrying five.
    let mut body = 10u32.to_le_bytes().to_vec();
    body.extend_from_slice(b"hello");
    let b = frame(MsgType::Rread as u8, 1, &body);
    assert!(matches!(decode_frame(&b), Err(Error::Protocol(_))));

    // Rread claiming a huge count must fail without allocating it.
    let b = frame(MsgType::Rread as u8, 1, &u32::MAX.to_le_bytes());
    assert!(matches!(decode_frame(&b), Err(Error::Protocol(_))));

    // Rstat whose outer length disagrees with the blob.
    let b = frame(MsgType::Rstat as u8, 1, &[4, 0, 1, 2]);
    assert!(matches!(decode_frame(&b), Err(Error::Protocol(_))));
}

#[test]
fn unknown_and_illegal_types_are_rejected() {
    assert!(decode_frame(&frame(99, 1, &[])).is_err());
    assert!(decode_frame(&frame(MsgType::Terror as u8, 1, &[])).is_err());
    assert!(decode_frame(&frame(200, 1, &[])).is_err());
}

#[test]
fn invalid_utf8_is_rejected() {
    let b = frame(MsgType::Rerror as u8, 1, &[2, 0, 0xc3, 0x28]);
    assert!(matches!(decode_frame(&b), Err(Error::Protocol(_))));
}

#[test]
fn wstat_with_only_name_keeps_sentinels() {
    let update = DirUpdate {
        name: Some("foo".to_owned()),
        ..Default::default()
    };
    let blob = update.to_dir().to_bytes().unwrap();

    assert_eq!(blob.len(), 52);
    assert_eq!(u16::from_le_bytes([blob[0], blob[1]]), 50);
    // type[2] dev[4] qid[13] mode[4] atime[4] mtime[4] length[8], all ones
    assert!(blob[2..41].iter().all(|&b| b == 0xff));
    assert_eq!(&blob[41..46], &[3, 0, b'f', b'o', b'o']);
    // uid, gid, muid are empty strings
    assert_eq!(&blob[46..], &[0, 0, 0, 0, 0, 0]);

    let d = Dir::from_bytes(&blob).unwrap();
    assert_eq!(d, update.to_dir());
    assert_eq!(d.mode, Perm(!0));
    assert_eq!(d.length, u64::MAX);

    let msg = Msg {
        tag: 1,
        body: Fcall::Twstat { fid: 3, stat: blob },
    };
    assert_eq!(decode_frame(&encode_frame(&msg).unwrap()).unwrap(), msg);
}

#[test]
fn dir_blob_validation() {
    let d = Dir {
        name: "lib".to_owned(),
        ..Default::default()
    };
    let mut blob = d.to_bytes().unwrap();
    assert_eq!(Dir::from_bytes(&blob).unwrap(), d);

    blob.push(0);
    assert!(Dir::from_bytes(&blob).is_err());
    assert!(Dir::from_bytes(&blob[..10]).is_err());
}

#[test]
fn unpack_directory_read() {
    let a = Dir {
        name: "a".to_owned(),
        ..Default::default()
    };
    let b = Dir {
        name: "bb".to_owned(),
        mode: Perm(DMDIR | 0o755),
        ..Default::default()
    };
    let mut buf = a.to_bytes().unwrap();
    buf.extend(b.to_bytes().unwrap());

    assert_eq!(unpack_dirs(&buf).unwrap(), vec![a, b]);
    assert!(unpack_dirs(&buf[..buf.len() - 1]).is_err());
    assert!(unpack_dirs(&[]).unwrap().is_empty());
}
