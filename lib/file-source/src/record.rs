use bytes::Bytes;
use indexmap::IndexMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub const ATTRIBUTE_FILE_NAME: &str = "log.file.name";
pub const ATTRIBUTE_FILE_PATH: &str = "log.file.path";

pub type Attributes = IndexMap<String, String>;

/// One decoded record read out of a file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Record {
    /// The decoded payload. UTF-8 unless the `nop` encoding is configured, in
    /// which case these are the raw bytes from the file.
    #[serde(serialize_with = "serialize_body")]
    pub body: Bytes,
    /// File name/path attributes followed by the configured static attributes.
    pub attributes: Attributes,
    /// The configured static resource attributes.
    pub resource: Attributes,
}

impl Record {
    pub fn body_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

fn serialize_body<S: serde::Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(body))
}

/// Receives every record the engine produces.
///
/// Called synchronously, once per completed record and in file order, from
/// the read cycle of the file that produced it. The engine keeps no reference
/// to the record afterwards. The token is cancelled once the engine has been
/// asked to shut down.
pub trait RecordEmitter: Send + Sync + 'static {
    fn emit(&self, cancel: &CancellationToken, record: Record);
}

impl<F> RecordEmitter for F
where
    F: Fn(&CancellationToken, Record) + Send + Sync + 'static,
{
    fn emit(&self, cancel: &CancellationToken, record: Record) {
        self(cancel, record)
    }
}
