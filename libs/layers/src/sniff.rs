//! TLS ClientHello sniffing on peeked bytes.
//!
//! The dispatcher only ever looks at the 3-byte record header. Parsing the
//! server name is a separate helper for drivers that already know they run
//! a TLS layer and want to annotate it.

/// Number of bytes the dispatcher peeks to recognise a ClientHello.
pub const TLS_SNIFF_LEN: usize = 3;

/// TLS record content type for handshake messages.
const RECORD_TYPE_HANDSHAKE: u8 = 0x16;

/// Record-layer major version shared by SSLv3 through TLS 1.2.
const RECORD_MAJOR_VERSION: u8 = 0x03;

/// Highest record-layer minor version accepted (TLS 1.2).
const RECORD_MAX_MINOR_VERSION: u8 = 0x03;

const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;

const EXTENSION_SERVER_NAME: u16 = 0x0000;

const SERVER_NAME_TYPE_HOST: u8 = 0x00;

/// Record header length: type (1) + version (2) + length (2).
const RECORD_HEADER_LEN: usize = 5;

/// Classification of the first bytes of a client stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsSniff {
    /// The bytes open a TLS handshake record (SSLv3 to TLS 1.2 header).
    ClientHello { minor: u8 },
    /// Enough bytes are present and they are not a TLS handshake record.
    NotTls,
    /// Fewer than [`TLS_SNIFF_LEN`] bytes are available. Not a verdict.
    Insufficient { available: usize },
}

impl TlsSniff {
    pub fn is_client_hello(&self) -> bool {
        matches!(self, TlsSniff::ClientHello { .. })
    }
}

/// Classify peeked bytes by the TLS record header.
///
/// Matches `0x16 0x03 {0x00..=0x03}` on raw octets. Only the first
/// [`TLS_SNIFF_LEN`] bytes are inspected.
pub fn classify_tls(data: &[u8]) -> TlsSniff {
    let &[record_type, major, minor, ..] = data else {
        return TlsSniff::Insufficient {
            available: data.len(),
        };
    };

    if record_type == RECORD_TYPE_HANDSHAKE
        && major == RECORD_MAJOR_VERSION
        && minor <= RECORD_MAX_MINOR_VERSION
    {
        TlsSniff::ClientHello { minor }
    } else {
        TlsSniff::NotTls
    }
}

/// Result of extracting the server name from a ClientHello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
    /// Server name, lowercased with any trailing dot removed.
    Found(String),
    /// A ClientHello without a server_name extension.
    NoSni,
    /// The bytes are not a TLS ClientHello.
    NotTls,
    /// The ClientHello is truncated or malformed.
    Malformed,
}

/// Big-endian reader over a byte slice that fails softly on truncation.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() < n {
            return None;
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    /// Read a length-prefixed block and return a reader over it.
    fn block_u8(&mut self) -> Option<Reader<'a>> {
        let len = self.u8()? as usize;
        self.take(len).map(Reader::new)
    }

    fn block_u16(&mut self) -> Option<Reader<'a>> {
        let len = self.u16()? as usize;
        self.take(len).map(Reader::new)
    }
}

/// Extract the SNI hostname from a buffered ClientHello record.
///
/// `data` must start at the record header. The handshake message may be
/// cut short by the record boundary; anything missing is `Malformed`.
pub fn client_hello_sni(data: &[u8]) -> SniResult {
    match classify_tls(data) {
        TlsSniff::ClientHello { .. } => {}
        TlsSniff::NotTls => return SniResult::NotTls,
        TlsSniff::Insufficient { .. } => return SniResult::Malformed,
    }

    if data.len() < RECORD_HEADER_LEN {
        return SniResult::Malformed;
    }
    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    let body = &data[RECORD_HEADER_LEN..];
    let body = &body[..record_len.min(body.len())];

    let mut handshake = Reader::new(body);
    match handshake.u8() {
        Some(HANDSHAKE_TYPE_CLIENT_HELLO) => {}
        Some(_) => return SniResult::NotTls,
        None => return SniResult::Malformed,
    }

    parse_client_hello(&mut handshake).unwrap_or(SniResult::Malformed)
}

fn parse_client_hello(handshake: &mut Reader<'_>) -> Option<SniResult> {
    let declared = handshake.u24()?;
    let mut hello = Reader::new(handshake.take(declared.min(handshake.data.len()))?);

    // client_version (2) + random (32)
    hello.take(34)?;
    hello.block_u8()?; // session_id
    hello.block_u16()?; // cipher_suites
    hello.block_u8()?; // compression_methods

    if hello.is_empty() {
        return Some(SniResult::NoSni);
    }

    let mut extensions = hello.block_u16()?;
    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let mut ext = extensions.block_u16()?;
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(&mut ext);
        }
    }

    Some(SniResult::NoSni)
}

fn parse_server_name(ext: &mut Reader<'_>) -> Option<SniResult> {
    let mut names = ext.block_u16()?;
    while !names.is_empty() {
        let name_type = names.u8()?;
        let name = names.block_u16()?;
        if name_type != SERVER_NAME_TYPE_HOST {
            continue;
        }
        let hostname = std::str::from_utf8(name.data).ok()?;
        if hostname.is_empty() {
            return None;
        }
        return Some(SniResult::Found(
            hostname.to_lowercase().trim_end_matches('.').to_string(),
        ));
    }

    Some(SniResult::NoSni)
}
