//! Graph codecs
//!
//! The storage core only requires that a graph round-trips through
//! encode/decode. Encoding streams into the destination file, so a graph that
//! fails to serialize leaves a partial file behind; the driver restores the
//! backup in that case.

use std::io::Write;
use std::sync::Arc;
use crate::core::config::CodecKind;
use crate::types::{AnnotationGraph, Result, SerializationError};

/// Serialization format for annotation graphs
pub trait GraphCodec: Send + Sync {
    /// Short format name for logs
    fn name(&self) -> &'static str;

    /// File extension used for graph files in this format
    fn extension(&self) -> &'static str;

    /// Stream the encoded graph into `out`
    fn encode(&self, graph: &AnnotationGraph, out: &mut dyn Write) -> Result<()>;

    /// Decode a complete file
    fn decode(&self, bytes: &[u8]) -> Result<AnnotationGraph>;
}

/// bincode codec
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

/// JSON codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

/// MessagePack codec
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackCodec;

impl GraphCodec for BincodeCodec {
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn extension(&self) -> &'static str {
        "bin"
    }

    fn encode(&self, graph: &AnnotationGraph, out: &mut dyn Write) -> Result<()> {
        bincode::serialize_into(out, graph).map_err(SerializationError::from)?;
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<AnnotationGraph> {
        Ok(bincode::deserialize(bytes).map_err(SerializationError::from)?)
    }
}

impl GraphCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn extension(&self) -> &'static str {
        "json"
    }

    fn encode(&self, graph: &AnnotationGraph, out: &mut dyn Write) -> Result<()> {
        serde_json::to_writer(out, graph).map_err(SerializationError::from)?;
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<AnnotationGraph> {
        Ok(serde_json::from_slice(bytes).map_err(SerializationError::from)?)
    }
}

impl GraphCodec for MessagePackCodec {
    fn name(&self) -> &'static str {
        "message-pack"
    }

    fn extension(&self) -> &'static str {
        "msgpack"
    }

    fn encode(&self, graph: &AnnotationGraph, out: &mut dyn Write) -> Result<()> {
        let mut out = out;
        rmp_serde::encode::write_named(&mut out, graph).map_err(SerializationError::from)?;
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<AnnotationGraph> {
        Ok(rmp_serde::from_slice(bytes).map_err(SerializationError::from)?)
    }
}

/// Build the codec selected in the configuration
pub fn codec_for(kind: CodecKind) -> Arc<dyn GraphCodec> {
    match kind {
        CodecKind::Bincode => Arc::new(BincodeCodec),
        CodecKind::Json => Arc::new(JsonCodec),
        CodecKind::MessagePack => Arc::new(MessagePackCodec),
    }
}
