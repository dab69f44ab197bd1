//! `permessage-deflate` support (RFC 7692).
//!
//! Two independent deflate streams exist per connection, one per direction.
//! "Context takeover" keeps the LZ77 dictionary alive across messages for
//! better ratios; "no context takeover" resets it after every message so the
//! stream holds no per-connection state, which is what allows those
//! directions to share contexts from a [`DeflatePool`] instead of owning one.
//!
//! Every compressed message ends with the `00 00 FF FF` trailer stripped on
//! emit; decompression reinserts it before inflating (RFC 7692 Section 7.2).

use std::{
    io,
    str::FromStr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
};

use bytes::{BufMut, BytesMut};
use flate2::{CompressError, DecompressError, Status};

use nom::{
    bytes::complete::tag,
    bytes::complete::take_while1,
    character::complete::digit1,
    character::complete::space0,
    combinator::opt,
    sequence::{pair, preceded},
    IResult,
};

use crate::{
    conn::Role,
    options::{DeflateConfig, MAX_WINDOW_BITS, MIN_WINDOW_BITS},
};

static PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// The deflate trailer stripped from every compressed message.
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Negotiated `permessage-deflate` parameters.
///
/// Produced by parsing a `Sec-WebSocket-Extensions` header and consumed when
/// building one. A server answers a client offer with
/// [`DeflateExt::negotiate`]; a client folds the server's answer into its own
/// configuration with [`DeflateExt::accept`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeflateExt {
    pub(crate) server_max_window_bits: Option<u8>,
    pub(crate) client_max_window_bits: Option<u8>,
    pub(crate) server_no_context_takeover: bool,
    pub(crate) client_no_context_takeover: bool,
}

impl DeflateExt {
    /// The offer a client sends, derived from its configuration.
    pub(crate) fn offer(cfg: &DeflateConfig) -> Self {
        Self {
            server_max_window_bits: window_bits_param(cfg.server_max_window_bits),
            client_max_window_bits: window_bits_param(cfg.client_max_window_bits),
            server_no_context_takeover: cfg.server_no_context_takeover,
            client_no_context_takeover: cfg.client_no_context_takeover,
        }
    }

    /// Server-side merge of the client's offer with the local configuration.
    ///
    /// No-context-takeover is sticky (either side may demand it) and window
    /// bits resolve to the minimum of what both sides are willing to use.
    pub(crate) fn negotiate(cfg: &DeflateConfig, offer: &Self) -> Self {
        Self {
            server_no_context_takeover: offer.server_no_context_takeover
                || cfg.server_no_context_takeover,
            client_no_context_takeover: offer.client_no_context_takeover
                || cfg.client_no_context_takeover,
            server_max_window_bits: min_window_bits(
                offer.server_max_window_bits,
                window_bits_param(cfg.server_max_window_bits),
            ),
            client_max_window_bits: min_window_bits(
                offer.client_max_window_bits,
                window_bits_param(cfg.client_max_window_bits),
            ),
        }
    }

    /// Client-side acceptance of the server's answer.
    ///
    /// The server's flags are authoritative; window bits shrink to whatever
    /// is smaller between the answer and the local configuration.
    pub(crate) fn accept(cfg: &DeflateConfig, answer: &Self) -> Self {
        Self {
            server_no_context_takeover: answer.server_no_context_takeover
                || cfg.server_no_context_takeover,
            client_no_context_takeover: answer.client_no_context_takeover
                || cfg.client_no_context_takeover,
            server_max_window_bits: min_window_bits(
                answer.server_max_window_bits,
                window_bits_param(cfg.server_max_window_bits),
            ),
            client_max_window_bits: min_window_bits(
                answer.client_max_window_bits,
                window_bits_param(cfg.client_max_window_bits),
            ),
        }
    }

    /// Effective sliding-window exponent for the server-to-client stream.
    pub fn server_bits(&self) -> u8 {
        effective_bits(self.server_max_window_bits)
    }

    /// Effective sliding-window exponent for the client-to-server stream.
    pub fn client_bits(&self) -> u8 {
        effective_bits(self.client_max_window_bits)
    }

    /// Whether the write side of `role` must reset its context per message.
    pub(crate) fn write_no_takeover(&self, role: Role) -> bool {
        match role {
            Role::Server => self.server_no_context_takeover,
            Role::Client => self.client_no_context_takeover,
        }
    }

    /// Whether the read side of `role` must reset its context per message.
    pub(crate) fn read_no_takeover(&self, role: Role) -> bool {
        match role {
            // A server decompresses the client's stream and vice versa.
            Role::Server => self.client_no_context_takeover,
            Role::Client => self.server_no_context_takeover,
        }
    }

    fn parse(input: &str) -> Result<Self, nom::Err<nom::error::Error<&str>>> {
        let mut this = Self::default();
        let (remaining, _) = tag(PERMESSAGE_DEFLATE)(input)?;
        this.parse_params(remaining)?;
        Ok(this)
    }

    fn parse_params<'a>(
        &mut self,
        mut input: &'a str,
    ) -> Result<(), nom::Err<nom::error::Error<&'a str>>> {
        while !input.is_empty() {
            let (remaining, (key, value)) = Self::parse_param(input)?;
            match key {
                "client_no_context_takeover" => {
                    self.client_no_context_takeover = true;
                }
                "server_no_context_takeover" => {
                    self.server_no_context_takeover = true;
                }
                "server_max_window_bits" => {
                    self.server_max_window_bits =
                        Some(value.map(|v| v.parse().unwrap_or_default()).unwrap_or(0));
                }
                "client_max_window_bits" => {
                    self.client_max_window_bits =
                        Some(value.map(|v| v.parse().unwrap_or_default()).unwrap_or(0));
                }
                _ => {}
            }

            input = remaining;
        }

        Ok(())
    }

    /// Parses one `; key[=digits]` parameter.
    fn parse_param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
        preceded(
            tag(";"),
            preceded(
                space0,
                pair(
                    take_while1(|c: char| c.is_alphanumeric() || c == '_'),
                    opt(preceded(tag("="), digit1)),
                ),
            ),
        )(input)
    }
}

impl std::fmt::Display for DeflateExt {
    /// Formats the parameters as a `Sec-WebSocket-Extensions` value.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", PERMESSAGE_DEFLATE)?;

        if let Some(bits) = self.server_max_window_bits {
            if (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
                write!(f, "; server_max_window_bits={}", bits)?;
            } else {
                write!(f, "; server_max_window_bits")?;
            }
        }
        if let Some(bits) = self.client_max_window_bits {
            if (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
                write!(f, "; client_max_window_bits={}", bits)?;
            } else {
                write!(f, "; client_max_window_bits")?;
            }
        }
        if self.server_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if self.client_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }

        Ok(())
    }
}

impl FromStr for DeflateExt {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input).map_err(|err| err.to_string())
    }
}

/// Advertise a window size only when it is below the protocol maximum;
/// 15 is the default and needs no parameter.
fn window_bits_param(bits: u8) -> Option<u8> {
    (bits < MAX_WINDOW_BITS).then_some(bits)
}

fn min_window_bits(a: Option<u8>, b: Option<u8>) -> Option<u8> {
    match (a.map(|b| effective_bits(Some(b))), b.map(|b| effective_bits(Some(b)))) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

/// A bare parameter (encoded here as 0) or an out-of-range value means the
/// sender accepts the default window.
fn effective_bits(bits: Option<u8>) -> u8 {
    match bits {
        Some(b) if (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&b) => b,
        _ => MAX_WINDOW_BITS,
    }
}

/// A deflate compressor for one direction of a connection.
///
/// With `resets` the dictionary is discarded before every message
/// (no context takeover); otherwise it carries over, trading memory for
/// ratio.
pub(crate) struct Compressor {
    resets: bool,
    output: BytesMut,
    raw: flate2::Compress,
}

impl Compressor {
    pub fn new(level: crate::CompressionLevel, resets: bool) -> Self {
        Self {
            resets,
            output: BytesMut::with_capacity(1024),
            raw: flate2::Compress::new(level, false),
        }
    }

    /// Builds a compressor with an explicit LZ77 window exponent.
    /// Requires the zlib backend; without it the stream always uses 15 bits.
    #[cfg(feature = "zlib")]
    pub fn with_window_bits(level: crate::CompressionLevel, window_bits: u8, resets: bool) -> Self {
        Self {
            resets,
            output: BytesMut::with_capacity(1024),
            raw: flate2::Compress::new_with_window_bits(level, false, window_bits),
        }
    }

    #[cfg(not(feature = "zlib"))]
    pub fn with_window_bits(level: crate::CompressionLevel, _window_bits: u8, resets: bool) -> Self {
        Self::new(level, resets)
    }

    /// Compresses one complete message, returning the payload with the
    /// final `00 00 FF FF` trailer already stripped.
    pub fn compress(&mut self, mut input: &[u8]) -> io::Result<BytesMut> {
        if self.resets {
            self.raw.reset();
        }

        while !input.is_empty() {
            let consumed = self.write(input)?;
            input = &input[consumed..];
        }
        self.finish()
    }

    fn write(&mut self, input: &[u8]) -> io::Result<usize> {
        let dst = chunk(&mut self.output);

        let before_out = self.raw.total_out();
        let before_in = self.raw.total_in();

        let status = self.raw.compress(input, dst, flate2::FlushCompress::None);

        let written = (self.raw.total_out() - before_out) as usize;
        let consumed = (self.raw.total_in() - before_in) as usize;

        unsafe { self.output.advance_mut(written) };

        match status {
            Ok(Status::Ok) => Ok(consumed),
            Ok(Status::StreamEnd | Status::BufError) | Err(..) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "corrupt deflate stream",
            )),
        }
    }

    /// Sync-flushes the stream and splits off the output, stripping the
    /// trailer the flush appends.
    fn finish(&mut self) -> io::Result<BytesMut> {
        let dst = chunk(&mut self.output);
        let before_out = self.raw.total_out();

        self.raw
            .compress(&[], dst, flate2::FlushCompress::Sync)
            .map_err(deflate_error)?;

        let written = (self.raw.total_out() - before_out) as usize;
        unsafe { self.output.advance_mut(written) };

        loop {
            let dst = chunk(&mut self.output);

            let before_out = self.raw.total_out();
            self.raw
                .compress(&[], dst, flate2::FlushCompress::None)
                .map_err(deflate_error)?;

            if before_out == self.raw.total_out() {
                if self.output.ends_with(&DEFLATE_TRAILER) {
                    self.output.truncate(self.output.len() - DEFLATE_TRAILER.len());
                }

                break Ok(self.output.split());
            }

            let written = (self.raw.total_out() - before_out) as usize;
            unsafe { self.output.advance_mut(written) };
        }
    }
}

/// The inflating counterpart of [`Compressor`].
pub(crate) struct Decompressor {
    resets: bool,
    output: BytesMut,
    raw: flate2::Decompress,
}

impl Decompressor {
    pub fn new(resets: bool) -> Self {
        Self {
            resets,
            output: BytesMut::with_capacity(1024),
            raw: flate2::Decompress::new(false),
        }
    }

    #[cfg(feature = "zlib")]
    pub fn with_window_bits(window_bits: u8, resets: bool) -> Self {
        Self {
            resets,
            output: BytesMut::with_capacity(1024),
            raw: flate2::Decompress::new_with_window_bits(false, window_bits),
        }
    }

    #[cfg(not(feature = "zlib"))]
    pub fn with_window_bits(_window_bits: u8, resets: bool) -> Self {
        Self::new(resets)
    }

    /// Inflates one complete (reassembled) message, reinserting the trailer
    /// the sender stripped.
    pub fn decompress(&mut self, input: &[u8]) -> io::Result<BytesMut> {
        if self.resets {
            self.raw.reset(false);
        }

        self.write(input)?;
        self.write(&DEFLATE_TRAILER)?;
        self.finish()
    }

    fn write(&mut self, mut input: &[u8]) -> io::Result<()> {
        while !input.is_empty() {
            let dst = chunk(&mut self.output);

            let before_out = self.raw.total_out();
            let before_in = self.raw.total_in();

            let status = self.raw.decompress(input, dst, flate2::FlushDecompress::None);

            let read = (self.raw.total_out() - before_out) as usize;
            let consumed = (self.raw.total_in() - before_in) as usize;

            unsafe { self.output.advance_mut(read) };

            input = &input[consumed..];

            match status {
                Ok(Status::Ok | Status::BufError | Status::StreamEnd) => {}
                Err(..) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "corrupt deflate stream",
                    ))
                }
            }
        }

        Ok(())
    }

    fn finish(&mut self) -> io::Result<BytesMut> {
        let dst = chunk(&mut self.output);
        let before_out = self.raw.total_out();

        self.raw
            .decompress(&[], dst, flate2::FlushDecompress::Sync)
            .map_err(inflate_error)?;

        let written = (self.raw.total_out() - before_out) as usize;
        unsafe { self.output.advance_mut(written) };

        loop {
            let dst = chunk(&mut self.output);

            let before_out = self.raw.total_out();
            self.raw
                .decompress(&[], dst, flate2::FlushDecompress::None)
                .map_err(inflate_error)?;

            if before_out == self.raw.total_out() {
                break Ok(self.output.split());
            }

            let written = (self.raw.total_out() - before_out) as usize;
            unsafe { self.output.advance_mut(written) };
        }
    }
}

fn deflate_error(err: CompressError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("compression error: {err}"))
}

fn inflate_error(err: DecompressError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("decompression error: {err}"))
}

/// Returns the buffer's spare capacity as an initialized byte slice,
/// reserving more when full.
///
/// Treating the uninitialized tail as `u8` is sound here since flate2 only
/// writes into it and we advance by exactly the written amount.
fn chunk(output: &mut BytesMut) -> &mut [u8] {
    if output.len() == output.capacity() {
        // chunk_mut would reserve only 64 bytes
        output.reserve(1024);
    }

    let uninit = output.spare_capacity_mut();
    unsafe { &mut *(uninit as *mut [std::mem::MaybeUninit<u8>] as *mut [u8]) }
}

/// Shared deflate contexts for no-context-takeover directions.
///
/// Slot count is a power of two so an atomic cursor can stripe acquisitions
/// with a mask instead of a modulo. Contexts are reset per message, so any
/// slot can serve any connection; a slot is only ever used sequentially
/// because the lock is held for the whole message.
pub(crate) struct DeflatePool {
    compressors: Vec<Mutex<Compressor>>,
    decompressors: Vec<Mutex<Decompressor>>,
    cursor: AtomicUsize,
}

impl DeflatePool {
    /// Builds a pool for endpoints of the given role.
    ///
    /// The compressor slots use the role's own window bits, the decompressor
    /// slots the peer's, mirroring how dedicated contexts are assigned.
    pub fn new(cfg: &DeflateConfig, role: Role) -> Self {
        let (compress_bits, decompress_bits) = match role {
            Role::Server => (cfg.server_max_window_bits, cfg.client_max_window_bits),
            Role::Client => (cfg.client_max_window_bits, cfg.server_max_window_bits),
        };

        let slots = cfg.pool_size.max(1);
        Self {
            compressors: (0..slots)
                .map(|_| Mutex::new(Compressor::with_window_bits(cfg.level, compress_bits, true)))
                .collect(),
            decompressors: (0..slots)
                .map(|_| Mutex::new(Decompressor::with_window_bits(decompress_bits, true)))
                .collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    fn next_index(&self) -> usize {
        // pool_size is a power of two
        self.cursor.fetch_add(1, Ordering::Relaxed) & (self.compressors.len() - 1)
    }

    pub fn compress(&self, input: &[u8]) -> io::Result<BytesMut> {
        let slot = &self.compressors[self.next_index()];
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        guard.compress(input)
    }

    pub fn decompress(&self, input: &[u8]) -> io::Result<BytesMut> {
        let slot = &self.decompressors[self.next_index()];
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        guard.decompress(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CompressionLevel;

    fn config() -> DeflateConfig {
        DeflateConfig {
            level: CompressionLevel::fast(),
            threshold: 512,
            pool_size: 4,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: 15,
            client_max_window_bits: 15,
        }
    }

    #[test]
    fn test_parse_extension_params() {
        let ext = DeflateExt::from_str(
            "permessage-deflate; client_no_context_takeover; server_max_window_bits=12; \
             client_max_window_bits=9; server_no_context_takeover",
        )
        .unwrap();
        assert!(ext.client_no_context_takeover);
        assert!(ext.server_no_context_takeover);
        assert_eq!(ext.server_max_window_bits, Some(12));
        assert_eq!(ext.client_max_window_bits, Some(9));
    }

    #[test]
    fn test_parse_bare_window_bits() {
        let ext = DeflateExt::from_str("permessage-deflate; client_max_window_bits").unwrap();
        assert_eq!(ext.client_max_window_bits, Some(0));
        assert_eq!(ext.client_bits(), 15);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(DeflateExt::from_str("permessage-deflate; client_max_window_bits=").is_err());
        assert!(DeflateExt::from_str("foo, bar; baz=1").is_err());
        assert!(DeflateExt::from_str(
            "permessage-deflate; client_no_context_takeover server_max_window_bits=7"
        )
        .is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let ext = DeflateExt {
            server_max_window_bits: Some(10),
            client_max_window_bits: None,
            server_no_context_takeover: true,
            client_no_context_takeover: false,
        };
        let parsed = DeflateExt::from_str(&ext.to_string()).unwrap();
        assert_eq!(parsed, ext);
    }

    #[test]
    fn test_negotiate_takes_minimum_window() {
        let mut cfg = config();
        cfg.server_max_window_bits = 11;

        let offer = DeflateExt {
            server_max_window_bits: Some(13),
            client_max_window_bits: Some(9),
            ..Default::default()
        };

        let agreed = DeflateExt::negotiate(&cfg, &offer);
        assert_eq!(agreed.server_bits(), 11);
        assert_eq!(agreed.client_bits(), 9);
    }

    #[test]
    fn test_negotiate_takeover_flags_are_sticky() {
        let mut cfg = config();
        cfg.server_no_context_takeover = true;

        let offer = DeflateExt {
            client_no_context_takeover: true,
            ..Default::default()
        };

        let agreed = DeflateExt::negotiate(&cfg, &offer);
        assert!(agreed.server_no_context_takeover);
        assert!(agreed.client_no_context_takeover);
    }

    #[test]
    fn test_read_write_sides_by_role() {
        let ext = DeflateExt {
            server_no_context_takeover: true,
            client_no_context_takeover: false,
            ..Default::default()
        };
        assert!(ext.write_no_takeover(Role::Server));
        assert!(!ext.write_no_takeover(Role::Client));
        assert!(ext.read_no_takeover(Role::Client));
        assert!(!ext.read_no_takeover(Role::Server));
    }

    #[test]
    fn test_round_trip_with_context() {
        let mut compressor = Compressor::new(CompressionLevel::fast(), false);
        let mut decompressor = Decompressor::new(false);

        // Repeated messages through the same contexts exercise takeover.
        for round in 0..3 {
            let data = format!("round {round}: the quick brown fox jumps over the lazy dog");
            let compressed = compressor.compress(data.as_bytes()).unwrap();
            assert!(!compressed.ends_with(&DEFLATE_TRAILER));

            let inflated = decompressor.decompress(&compressed).unwrap();
            assert_eq!(&inflated[..], data.as_bytes());
        }
    }

    #[test]
    fn test_round_trip_without_context() {
        let mut compressor = Compressor::new(CompressionLevel::fast(), true);
        let mut decompressor = Decompressor::new(true);

        for _ in 0..3 {
            let data = b"independent message, dictionary reset in between";
            let compressed = compressor.compress(data).unwrap();
            let inflated = decompressor.decompress(&compressed).unwrap();
            assert_eq!(&inflated[..], &data[..]);
        }
    }

    #[test]
    fn test_no_context_output_is_deterministic() {
        let mut compressor = Compressor::new(CompressionLevel::fast(), true);
        let data = b"same bytes in, same bytes out";
        let first = compressor.compress(data).unwrap();
        let second = compressor.compress(data).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let mut compressor = Compressor::new(CompressionLevel::fast(), true);
        let mut decompressor = Decompressor::new(true);

        let compressed = compressor.compress(&[]).unwrap();
        let inflated = decompressor.decompress(&compressed).unwrap();
        assert!(inflated.is_empty());
    }

    #[test]
    fn test_pool_round_trip() {
        let pool = DeflatePool::new(&config(), Role::Server);

        for i in 0..16 {
            let data = format!("pooled message number {i}").into_bytes();
            let compressed = pool.compress(&data).unwrap();
            let inflated = pool.decompress(&compressed).unwrap();
            assert_eq!(inflated[..], data[..]);
        }
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn test_window_bits_round_trip() {
        for bits in [8u8, 15] {
            let mut compressor = Compressor::with_window_bits(CompressionLevel::fast(), bits, true);
            let mut decompressor = Decompressor::with_window_bits(bits, true);

            let data: Vec<u8> = (0..4096).map(|i| (i % 7) as u8).collect();
            let compressed = compressor.compress(&data).unwrap();
            let inflated = decompressor.decompress(&compressed).unwrap();
            assert_eq!(&inflated[..], &data[..]);
        }
    }
}
