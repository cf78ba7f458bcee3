//! Operation envelope headers and wire record types.
//!
//! Bodies are encoded with `bincode`, a self-describing-enough, tagged
//! binary codec: it round-trips the `Operation`/`*Result` types below
//! byte-for-byte regardless of which side of the wire produced them.

pub mod chunk;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// `X-RNS-OP` header name.
pub const HEADER_OP: &str = "X-RNS-OP";
/// `X-RNS-MSGID` header name.
pub const HEADER_MSGID: &str = "X-RNS-MSGID";
/// `X-RNS-CHUNKS` header name.
pub const HEADER_CHUNKS: &str = "X-RNS-CHUNKS";
/// `X-RNS-CHUNK-SUBJECT` header name.
pub const HEADER_CHUNK_SUBJECT: &str = "X-RNS-CHUNK-SUBJECT";
/// `X-RNS-CHUNKS-SEQ` header name.
pub const HEADER_CHUNKS_SEQ: &str = "X-RNS-CHUNKS-SEQ";

const MSGID_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A 16-character random transaction or client id.
pub fn random_token() -> String {
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| MSGID_ALPHABET[rng.gen_range(0..MSGID_ALPHABET.len())] as char)
        .collect()
}

/// Operation kind selected by `X-RNS-OP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Open,
    Stat,
    Mkdir,
    Save,
    List,
    Load,
    Remove,
    Close,
}

impl OpKind {
    pub fn as_header_value(self) -> &'static str {
        match self {
            OpKind::Open => "open",
            OpKind::Stat => "stat",
            OpKind::Mkdir => "mkdir",
            OpKind::Save => "save",
            OpKind::List => "list",
            OpKind::Load => "load",
            OpKind::Remove => "remove",
            OpKind::Close => "close",
        }
    }

    pub fn from_header_value(value: &str) -> Option<Self> {
        Some(match value {
            "open" => OpKind::Open,
            "stat" => OpKind::Stat,
            "mkdir" => OpKind::Mkdir,
            "save" => OpKind::Save,
            "list" => OpKind::List,
            "load" => OpKind::Load,
            "remove" => OpKind::Remove,
            "close" => OpKind::Close,
            _ => return None,
        })
    }
}

/// Identifies the bucket an operation runs against: either named directly
/// (only valid for `open`) or resolved through a session's `client_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BucketRef {
    Bucket(String),
    ClientId(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOp {
    pub bucket: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenResult {
    pub ok: bool,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatOp {
    pub bucket_ref: BucketRef,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatResult {
    pub ok: bool,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MkdirOp {
    pub bucket_ref: BucketRef,
    pub dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MkdirResult {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveOp {
    pub bucket_ref: BucketRef,
    pub dir: String,
    pub name: String,
    pub filesize: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveResult {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListOp {
    pub bucket_ref: BucketRef,
    pub base_dir: String,
    pub recurse: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResult {
    pub ok: bool,
    pub entries: Vec<FileInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadOp {
    pub bucket_ref: BucketRef,
    pub dir: String,
    pub name: String,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadResult {
    pub ok: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveOp {
    pub bucket_ref: BucketRef,
    pub dir: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveResult {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseOp {
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseResult {
    pub ok: bool,
}

/// Tagged request variant carrying every operation's decoded body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    Open(OpenOp),
    Stat(StatOp),
    Mkdir(MkdirOp),
    Save(SaveOp),
    List(ListOp),
    Load(LoadOp),
    Remove(RemoveOp),
    Close(CloseOp),
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Open(_) => OpKind::Open,
            Operation::Stat(_) => OpKind::Stat,
            Operation::Mkdir(_) => OpKind::Mkdir,
            Operation::Save(_) => OpKind::Save,
            Operation::List(_) => OpKind::List,
            Operation::Load(_) => OpKind::Load,
            Operation::Remove(_) => OpKind::Remove,
            Operation::Close(_) => OpKind::Close,
        }
    }

    /// Decode a request body according to the op named by `X-RNS-OP`.
    pub fn decode(kind: OpKind, body: &[u8]) -> Result<Self> {
        Ok(match kind {
            OpKind::Open => Operation::Open(decode(body)?),
            OpKind::Stat => Operation::Stat(decode(body)?),
            OpKind::Mkdir => Operation::Mkdir(decode(body)?),
            OpKind::Save => Operation::Save(decode(body)?),
            OpKind::List => Operation::List(decode(body)?),
            OpKind::Load => Operation::Load(decode(body)?),
            OpKind::Remove => Operation::Remove(decode(body)?),
            OpKind::Close => Operation::Close(decode(body)?),
        })
    }
}

/// Tagged reply variant. Every variant carries an `ok: bool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationResult {
    Open(OpenResult),
    Stat(StatResult),
    Mkdir(MkdirResult),
    Save(SaveResult),
    List(ListResult),
    Load(LoadResult),
    Remove(RemoveResult),
    Close(CloseResult),
}

impl OperationResult {
    pub fn ok(&self) -> bool {
        match self {
            OperationResult::Open(r) => r.ok,
            OperationResult::Stat(r) => r.ok,
            OperationResult::Mkdir(r) => r.ok,
            OperationResult::Save(r) => r.ok,
            OperationResult::List(r) => r.ok,
            OperationResult::Load(r) => r.ok,
            OperationResult::Remove(r) => r.ok,
            OperationResult::Close(r) => r.ok,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            OperationResult::Open(r) => bincode::serialize(r),
            OperationResult::Stat(r) => bincode::serialize(r),
            OperationResult::Mkdir(r) => bincode::serialize(r),
            OperationResult::Save(r) => bincode::serialize(r),
            OperationResult::List(r) => bincode::serialize(r),
            OperationResult::Load(r) => bincode::serialize(r),
            OperationResult::Remove(r) => bincode::serialize(r),
            OperationResult::Close(r) => bincode::serialize(r),
        };
        Ok(bytes?)
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
    bincode::deserialize(body).map_err(|e| Error::Protocol(format!("decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_token_is_16_chars_of_the_alphabet() {
        let tok = random_token();
        assert_eq!(tok.len(), 16);
        assert!(tok.bytes().all(|b| MSGID_ALPHABET.contains(&b)));
    }

    #[test]
    fn two_random_tokens_differ() {
        assert_ne!(random_token(), random_token());
    }

    #[test]
    fn op_kind_round_trips_through_header_value() {
        for kind in [
            OpKind::Open,
            OpKind::Stat,
            OpKind::Mkdir,
            OpKind::Save,
            OpKind::List,
            OpKind::Load,
            OpKind::Remove,
            OpKind::Close,
        ] {
            let value = kind.as_header_value();
            assert_eq!(OpKind::from_header_value(value), Some(kind));
        }
        assert_eq!(OpKind::from_header_value("compact"), None);
    }

    #[test]
    fn save_op_round_trips_through_bincode() {
        let op = SaveOp {
            bucket_ref: BucketRef::Bucket("alice".to_string()),
            dir: "d".to_string(),
            name: "f".to_string(),
            filesize: 3,
            data: vec![1, 2, 3],
        };
        let encoded = bincode::serialize(&op).unwrap();
        let decoded: SaveOp = decode(&encoded).unwrap();
        assert_eq!(decoded.data, vec![1, 2, 3]);
        assert_eq!(decoded.filesize, 3);
    }

    #[test]
    fn operation_decode_dispatches_on_kind() {
        let op = OpenOp {
            bucket: "alice".to_string(),
        };
        let body = bincode::serialize(&op).unwrap();
        let decoded = Operation::decode(OpKind::Open, &body).unwrap();
        assert!(matches!(decoded, Operation::Open(o) if o.bucket == "alice"));
    }
}
