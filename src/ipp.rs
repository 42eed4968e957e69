//! IPP message framing: enough to split a request out of a POST body and write a response.
//! Attribute semantics belong to whatever [`IppHandler`] is plugged in.

use log::debug;
use thiserror::Error;

use crate::spool::SpoolFile;

pub const TAG_OPERATION: u8 = 0x01;
pub const TAG_END: u8 = 0x03;
const TAG_EXTENSION: u8 = 0x7f;
pub const TAG_CHARSET: u8 = 0x47;
pub const TAG_LANGUAGE: u8 = 0x48;

pub const STATUS_OPERATION_NOT_SUPPORTED: u16 = 0x0501;

/// Largest request header (everything before the document data) we buffer.
const MAX_MESSAGE: usize = 1 << 20;

#[derive(Debug, Error, PartialEq)]
pub enum IppError {
    #[error("invalid tag 0x{0:02x}")]
    BadTag(u8),
    #[error("additional value without an attribute")]
    OrphanValue,
    #[error("attribute name is not UTF-8")]
    BadName,
    #[error("message exceeds {} bytes", MAX_MESSAGE)]
    TooLarge,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IppAttribute {
    pub group: u8,
    pub value_tag: u8,
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

impl IppAttribute {
    pub fn text(group: u8, value_tag: u8, name: &str, value: &str) -> Self {
        Self {
            group,
            value_tag,
            name: name.to_string(),
            values: vec![value.as_bytes().to_vec()],
        }
    }

    /// First value as text.
    pub fn as_str(&self) -> Option<&str> {
        self.values
            .first()
            .and_then(|value| std::str::from_utf8(value).ok())
    }
}

/// A request or response. `code` is the operation for requests and the status for responses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IppMessage {
    pub version: (u8, u8),
    pub code: u16,
    pub request_id: u32,
    pub attributes: Vec<IppAttribute>,
}

impl IppMessage {
    pub fn find(&self, name: &str) -> Option<&IppAttribute> {
        self.attributes.iter().find(|attr| attr.name == name)
    }

    /// Value of `attributes-natural-language`, if the client sent one.
    pub fn natural_language(&self) -> Option<&str> {
        self.find("attributes-natural-language")
            .filter(|attr| attr.value_tag == TAG_LANGUAGE)
            .and_then(IppAttribute::as_str)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&[self.version.0, self.version.1]);
        out.extend_from_slice(&self.code.to_be_bytes());
        out.extend_from_slice(&self.request_id.to_be_bytes());
        let mut group = None;
        for attr in &self.attributes {
            if group != Some(attr.group) {
                out.push(attr.group);
                group = Some(attr.group);
            }
            for (i, value) in attr.values.iter().enumerate() {
                out.push(attr.value_tag);
                let name: &[u8] = if i == 0 { attr.name.as_bytes() } else { b"" };
                out.extend_from_slice(&(name.len() as u16).to_be_bytes());
                out.extend_from_slice(name);
                out.extend_from_slice(&(value.len() as u16).to_be_bytes());
                out.extend_from_slice(value);
            }
        }
        out.push(TAG_END);
        out
    }
}

/// Accumulates body bytes until a whole message is available.
///
/// Attributes are decoded as soon as they are complete, so each byte is looked at once.
#[derive(Debug, Default)]
pub struct IppDecoder {
    buf: Vec<u8>,
    /// Start of the first item not yet decoded.
    pos: usize,
    group: u8,
    /// Present once the fixed header is in.
    message: Option<IppMessage>,
}

impl IppDecoder {
    /// Add bytes. Returns the message once complete, along with any bytes that followed it.
    pub fn push(&mut self, data: &[u8]) -> Result<Option<(IppMessage, Vec<u8>)>, IppError> {
        self.buf.extend_from_slice(data);
        if self.message.is_none() {
            let header = match self.buf.get(..8) {
                Some(header) => header,
                None => return Ok(None),
            };
            self.message = Some(IppMessage {
                version: (header[0], header[1]),
                code: u16::from_be_bytes([header[2], header[3]]),
                request_id: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
                attributes: Vec::new(),
            });
            self.pos = 8;
        }

        loop {
            let mut cursor = Cursor {
                data: &self.buf,
                pos: self.pos,
            };
            let message = match self.message.as_mut() {
                Some(message) => message,
                None => return Ok(None),
            };
            let done = match read_item(&mut cursor, message, &mut self.group)? {
                Some(done) => done,
                None if self.buf.len() > MAX_MESSAGE => return Err(IppError::TooLarge),
                None => return Ok(None),
            };
            self.pos = cursor.pos;
            if done {
                let rest = self.buf.split_off(self.pos);
                let decoded = std::mem::take(self);
                return Ok(decoded.message.map(|message| (message, rest)));
            }
        }
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let bytes = self.data.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(bytes)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }
}

/// Decode one tag and what belongs to it into `message`.
///
/// `Ok(None)` means the item is not all there yet; `Ok(Some(true))` means the end tag was read.
fn read_item(
    cursor: &mut Cursor<'_>,
    message: &mut IppMessage,
    group: &mut u8,
) -> Result<Option<bool>, IppError> {
    macro_rules! need {
        ($e:expr) => {
            match $e {
                Some(value) => value,
                None => return Ok(None),
            }
        };
    }

    let tag = need!(cursor.u8());
    if tag == TAG_END {
        return Ok(Some(true));
    }
    if tag == 0 || tag == TAG_EXTENSION {
        return Err(IppError::BadTag(tag));
    }
    if tag < 0x10 {
        *group = tag;
        return Ok(Some(false));
    }
    let name_len = need!(cursor.u16()) as usize;
    let name = need!(cursor.take(name_len));
    let value_len = need!(cursor.u16()) as usize;
    let value = need!(cursor.take(value_len)).to_vec();
    if name.is_empty() {
        let attr = message
            .attributes
            .last_mut()
            .ok_or(IppError::OrphanValue)?;
        attr.values.push(value);
    } else {
        let name = std::str::from_utf8(name).map_err(|_| IppError::BadName)?;
        message.attributes.push(IppAttribute {
            group: *group,
            value_tag: tag,
            name: name.to_string(),
            values: vec![value],
        });
    }
    Ok(Some(false))
}

/// What a handler may look at besides the request itself.
pub struct IppContext<'a> {
    /// Document data that followed the request; take it to keep it past the request.
    pub document: &'a mut Option<SpoolFile>,
    pub username: Option<&'a str>,
    pub hostname: &'a str,
}

/// Processes decoded IPP requests.
pub trait IppHandler {
    fn process(&mut self, request: &IppMessage, context: IppContext<'_>) -> IppMessage;
}

/// Start a response to `request` with the standard operation attributes.
pub fn response_for(request: &IppMessage, status: u16) -> IppMessage {
    let language = request.natural_language().unwrap_or("en");
    IppMessage {
        version: request.version,
        code: status,
        request_id: request.request_id,
        attributes: vec![
            IppAttribute::text(TAG_OPERATION, TAG_CHARSET, "attributes-charset", "utf-8"),
            IppAttribute::text(
                TAG_OPERATION,
                TAG_LANGUAGE,
                "attributes-natural-language",
                language,
            ),
        ],
    }
}

/// Answers every operation with `server-error-operation-not-supported`.
#[derive(Debug, Default)]
pub struct NotSupported;

impl IppHandler for NotSupported {
    fn process(&mut self, request: &IppMessage, context: IppContext<'_>) -> IppMessage {
        debug!(
            "operation 0x{:04x} from {} is not supported",
            request.code, context.hostname
        );
        response_for(request, STATUS_OPERATION_NOT_SUPPORTED)
    }
}
