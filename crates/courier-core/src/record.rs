//! Discovery record model, parser, and serializer.
//!
//! The discovery cache file is a sequence of record blocks with a
//! self-synchronizing textual framing:
//!
//! ```text
//! FILE      := (SLOPLINE* SEPLINE RECBLOCK)*
//! SEPLINE   := "%%%\n"
//! RECBLOCK  := CLASSJSON "\n" "\n" CERTPEM "\n" SIGB64 "\n" "\n"
//! ```
//!
//! `CLASSJSON` is one line of JSON describing the advertised classes,
//! `CERTPEM` is one or more PEM certificate blocks, and `SIGB64` is the
//! base64 record signature wrapped at 76 columns on write (any width on
//! read). The parser is line-oriented and tolerates slop between records;
//! a malformed block aborts the whole parse.

use serde::{Deserialize, Serialize};

use crate::crypto::{self, CryptoError, RecordSigningKey, sign_sha256, split_signature_rows};

/// Separator line opening each record block.
pub const RECORD_SEPARATOR: &str = "%%%";

/// Errors from record parsing and construction.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// A record block violates the cache file grammar.
    #[error("malformed record: {reason}")]
    Malformed {
        /// What failed to parse.
        reason: String,
    },

    /// The class-record line is not valid JSON.
    #[error("invalid class records: {0}")]
    ClassRecords(#[from] serde_json::Error),

    /// Certificate or signature material failed to parse or verify.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl RecordError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// One action advertised by a service class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Action name within its class.
    pub name: String,
    /// CRUD tags describing the action's effect.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub crud_tags: String,
    /// Action version.
    pub version: i64,
}

/// One service class with its actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRecord {
    /// Class name.
    pub name: String,
    /// Actions the class advertises.
    pub actions: Vec<ActionRecord>,
}

/// The signed class-record payload: everything a service advertises about
/// itself, serialized as one line of JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRecords {
    /// Record format version.
    pub version: u32,
    /// Unique service instance identity.
    pub ident: String,
    /// Administrative sector the service belongs to.
    pub sector: String,
    /// Relative routing weight.
    pub weight: u32,
    /// Seconds between discovery announcements.
    pub announce_interval: u64,
    /// `host:port` the service listens on.
    pub connspec: String,
    /// Envelope protocols the service speaks.
    pub protocols: Vec<String>,
    /// Advertised classes.
    pub classes: Vec<ClassRecord>,
}

/// The raw pieces of one parsed record block, before verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBlock {
    /// The class-record JSON line, byte-exact as signed.
    pub class_records: String,
    /// Accumulated PEM certificate lines.
    pub certificate: String,
    /// Accumulated base64 signature lines (embedded newlines preserved).
    pub signature: String,
}

/// A verified-or-verifiable cache entry describing a remote service.
///
/// Constructed by the parser; owned by the cache thereafter.
#[derive(Debug, Clone)]
pub struct ServiceProxy {
    records: ClassRecords,
    certificate: Vec<u8>,
    signature: Vec<u8>,
    class_records_raw: Vec<u8>,
}

impl ServiceProxy {
    /// Builds a proxy from the raw pieces of a record block.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::ClassRecords`] if the class-record line is
    /// not valid JSON.
    pub fn from_block(block: &RecordBlock) -> Result<Self, RecordError> {
        let records: ClassRecords = serde_json::from_str(&block.class_records)?;
        Ok(Self {
            records,
            certificate: block.certificate.clone().into_bytes(),
            signature: block.signature.clone().into_bytes(),
            class_records_raw: block.class_records.clone().into_bytes(),
        })
    }

    /// Verifies the record signature over the raw class-record bytes using
    /// the public key of the block's first certificate.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`CryptoError`] on parse or verify failure.
    pub fn validate(&self) -> Result<(), CryptoError> {
        crypto::verify_sha256(&self.certificate, &self.class_records_raw, &self.signature)
    }

    /// Service instance identity.
    #[must_use]
    pub fn ident(&self) -> &str {
        &self.records.ident
    }

    /// Administrative sector.
    #[must_use]
    pub fn sector(&self) -> &str {
        &self.records.sector
    }

    /// `host:port` the service listens on.
    #[must_use]
    pub fn connspec(&self) -> &str {
        &self.records.connspec
    }

    /// The decoded class-record payload.
    #[must_use]
    pub fn records(&self) -> &ClassRecords {
        &self.records
    }

    /// PEM certificate bytes as read from the record block.
    #[must_use]
    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    /// Raw signature bytes (wrapped base64) as read from the record block.
    #[must_use]
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// The class-record JSON exactly as signed.
    #[must_use]
    pub fn class_records_raw(&self) -> &[u8] {
        &self.class_records_raw
    }

    /// The action-index keys this proxy is stored under: one per
    /// `(class, action, protocol)` tuple.
    #[must_use]
    pub fn store_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for class in &self.records.classes {
            for action in &class.actions {
                for protocol in &self.records.protocols {
                    keys.push(store_key(
                        &self.records.sector,
                        &class.name,
                        &action.name,
                        action.version,
                        protocol,
                    ));
                }
            }
        }
        keys
    }
}

/// Store-time action-index key: `sector:class.action~version#protocol`.
#[must_use]
pub fn store_key(
    sector: &str,
    class_name: &str,
    action_name: &str,
    version: i64,
    protocol: &str,
) -> String {
    format!("{sector}:{class_name}.{action_name}~{version}#{protocol}")
}

/// Query-time action-index key: `sector:action~version#envelope`.
///
/// Callers pass `action` as the already-joined `Class.action` composite, so
/// this lines up with [`store_key`] despite the different shape.
#[must_use]
pub fn search_key(sector: &str, action: &str, version: i64, envelope: &str) -> String {
    format!("{sector}:{action}~{version}#{envelope}")
}

/// Parses a cache file into its record blocks.
///
/// Scans for `%%%` separator lines, skipping slop in between, and
/// accumulates the class JSON, certificate, and signature of each block.
/// A separator encountered while accumulating signature lines terminates
/// the block and opens the next one.
///
/// # Errors
///
/// Returns [`RecordError::Malformed`] on any grammar violation; callers
/// discard partial results.
pub fn parse_record_blocks(input: &str) -> Result<Vec<RecordBlock>, RecordError> {
    let mut lines = input.lines();
    let mut blocks = Vec::new();
    let mut separator_consumed = false;

    'blocks: loop {
        if !separator_consumed {
            loop {
                match lines.next() {
                    None => break 'blocks,
                    Some(RECORD_SEPARATOR) => break,
                    Some(_) => {},
                }
            }
        }
        separator_consumed = false;

        // End of file with trailing blanks after the separator is a clean
        // stop, not an error.
        let class_records = match lines.next() {
            None => break,
            Some("") => break,
            Some(line) => line.to_string(),
        };

        match lines.next() {
            Some("") => {},
            _ => return Err(RecordError::malformed("expected blank line after class records")),
        }

        let mut certificate = String::new();
        loop {
            match lines.next() {
                None | Some("") => break,
                Some(line) => {
                    certificate.push_str(line);
                    certificate.push('\n');
                },
            }
        }
        if certificate.pop().is_none() {
            return Err(RecordError::malformed("missing certificate"));
        }

        let mut signature = String::new();
        loop {
            match lines.next() {
                None | Some("") => break,
                Some(RECORD_SEPARATOR) => {
                    separator_consumed = true;
                    break;
                },
                Some(line) => {
                    signature.push_str(line);
                    signature.push('\n');
                },
            }
        }
        if signature.pop().is_none() {
            return Err(RecordError::malformed("missing signature"));
        }

        blocks.push(RecordBlock {
            class_records,
            certificate,
            signature,
        });
    }

    Ok(blocks)
}

/// Renders one record block body: class JSON, certificate, and wrapped
/// signature, each section separated by a blank line, with a trailing blank
/// line to separate it from the next record.
#[must_use]
pub fn render_record(class_records_json: &str, certificate_pem: &str, signature_b64: &str) -> String {
    let mut out = String::with_capacity(
        class_records_json.len() + certificate_pem.len() + signature_b64.len() + 16,
    );
    out.push_str(class_records_json);
    out.push_str("\n\n");
    out.push_str(certificate_pem);
    out.push_str("\n\n");
    for row in split_signature_rows(signature_b64) {
        out.push_str(row);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Serializes and signs `records`, rendering a complete block body ready to
/// follow a `%%%` separator in the cache file.
///
/// # Errors
///
/// Returns [`RecordError::ClassRecords`] if serialization fails.
pub fn render_signed_record(
    records: &ClassRecords,
    certificate_pem: &str,
    signing_key: &RecordSigningKey,
) -> Result<String, RecordError> {
    let json = serde_json::to_string(records)?;
    let signature = sign_sha256(signing_key, json.as_bytes());
    Ok(render_record(&json, certificate_pem.trim(), &signature))
}
