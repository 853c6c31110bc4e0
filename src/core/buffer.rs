//! Growable byte buffer dengan read/write cursor
//!
//! Layout:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! |                   |     (CONTENT)    |                  |
//! +-------------------+------------------+------------------+
//! 0      <=      reader_index   <=   writer_index    <=    capacity
//! ```
//!
//! Prinsip desain:
//! - Cheap prepend: 8 byte di depan readable window untuk header tanpa copy
//! - Compact sebelum grow: ruang di depan dipakai ulang sebelum realokasi
//! - Network byte order: semua integer codec big-endian

use std::io::{self, IoSliceMut, Read};

/// Ruang prepend default (cukup untuk satu i64 header)
pub const CHEAP_PREPEND: usize = 8;
/// Ukuran awal writable area
pub const INITIAL_SIZE: usize = 1024;
/// Scratch buffer di stack untuk `read_from` (64KB)
const EXTRA_READ_SIZE: usize = 64 * 1024;

const CRLF: &[u8] = b"\r\n";

/// Byte buffer dengan reader/writer index.
///
/// Invariant: `CHEAP_PREPEND <= reader_index <= writer_index <= capacity`
/// setelah konstruksi, kecuali `prepend` yang boleh memakai area prepend.
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Membuat buffer baru dengan writable area `INITIAL_SIZE`
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Membuat buffer dengan writable area awal `initial_size`
    pub fn with_capacity(initial_size: usize) -> Self {
        Self {
            buf: vec![0; CHEAP_PREPEND + initial_size],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// Total backing storage (prepend + readable + writable)
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    #[inline]
    pub fn writer_index(&self) -> usize {
        self.writer_index
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// Readable window, tanpa memajukan reader index
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Offset (relatif terhadap `peek()`) dari `\r\n` pertama
    pub fn find_crlf(&self) -> Option<usize> {
        self.find_crlf_from(0)
    }

    /// Seperti `find_crlf`, mulai dari offset `start` di readable window
    pub fn find_crlf_from(&self, start: usize) -> Option<usize> {
        let readable = self.peek();
        if start > readable.len() {
            return None;
        }
        readable[start..]
            .windows(CRLF.len())
            .position(|w| w == CRLF)
            .map(|pos| start + pos)
    }

    /// Offset dari `\n` pertama
    pub fn find_eol(&self) -> Option<usize> {
        self.find_eol_from(0)
    }

    pub fn find_eol_from(&self, start: usize) -> Option<usize> {
        let readable = self.peek();
        if start > readable.len() {
            return None;
        }
        readable[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| start + pos)
    }

    /// Buang `len` byte dari depan readable window.
    ///
    /// # Panics
    /// Panic jika `len > readable_bytes()`
    pub fn retrieve(&mut self, len: usize) {
        assert!(
            len <= self.readable_bytes(),
            "retrieve {} bytes but only {} readable",
            len,
            self.readable_bytes()
        );
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Buang semua byte sampai (tidak termasuk) offset `end` di readable window
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end);
    }

    #[inline]
    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    pub fn retrieve_as_vec(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let out = self.peek()[..len].to_vec();
        self.retrieve(len);
        out
    }

    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        self.retrieve_as_vec(self.readable_bytes())
    }

    /// Invalid UTF-8 diganti dengan U+FFFD
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        assert!(len <= self.readable_bytes());
        let out = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        out
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    /// Append data ke belakang readable window
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.writer_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Pastikan minimal `len` byte writable.
    ///
    /// Compact (geser readable ke depan) kalau total ruang kosong cukup,
    /// grow kalau tidak.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Writable area untuk diisi langsung, lalu `has_written`
    #[inline]
    pub fn begin_write(&mut self) -> &mut [u8] {
        let start = self.writer_index;
        &mut self.buf[start..]
    }

    #[inline]
    pub fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_bytes());
        self.writer_index += len;
    }

    /// Batalkan `len` byte terakhir yang di-append
    pub fn unwrite(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        self.writer_index -= len;
    }

    /// Tulis `data` tepat sebelum readable window (zero-copy header).
    ///
    /// # Panics
    /// Panic jika `data.len() > prependable_bytes()`
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.prependable_bytes(),
            "prepend {} bytes but only {} prependable",
            data.len(),
            self.prependable_bytes()
        );
        self.reader_index -= data.len();
        let start = self.reader_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
    }

    /// Kecilkan backing storage ke readable + `reserve`
    pub fn shrink(&mut self, reserve: usize) {
        let mut other = Buffer::with_capacity(self.readable_bytes() + reserve);
        other.append(self.peek());
        *self = other;
    }

    // ---- network byte order codec ----

    pub fn append_i64(&mut self, x: i64) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_i32(&mut self, x: i32) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_i16(&mut self, x: i16) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_i8(&mut self, x: i8) {
        self.append(&x.to_be_bytes());
    }

    /// # Panics
    /// Panic jika readable < 8
    pub fn peek_i64(&self) -> i64 {
        i64::from_be_bytes(self.peek_array())
    }

    pub fn peek_i32(&self) -> i32 {
        i32::from_be_bytes(self.peek_array())
    }

    pub fn peek_i16(&self) -> i16 {
        i16::from_be_bytes(self.peek_array())
    }

    pub fn peek_i8(&self) -> i8 {
        i8::from_be_bytes(self.peek_array())
    }

    pub fn read_i64(&mut self) -> i64 {
        let x = self.peek_i64();
        self.retrieve(8);
        x
    }

    pub fn read_i32(&mut self) -> i32 {
        let x = self.peek_i32();
        self.retrieve(4);
        x
    }

    pub fn read_i16(&mut self) -> i16 {
        let x = self.peek_i16();
        self.retrieve(2);
        x
    }

    pub fn read_i8(&mut self) -> i8 {
        let x = self.peek_i8();
        self.retrieve(1);
        x
    }

    pub fn prepend_i64(&mut self, x: i64) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_i32(&mut self, x: i32) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_i16(&mut self, x: i16) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_i8(&mut self, x: i8) {
        self.prepend(&x.to_be_bytes());
    }

    #[inline]
    fn peek_array<const N: usize>(&self) -> [u8; N] {
        assert!(
            self.readable_bytes() >= N,
            "peek {} bytes but only {} readable",
            N,
            self.readable_bytes()
        );
        let mut out = [0u8; N];
        out.copy_from_slice(&self.peek()[..N]);
        out
    }

    /// Baca dari `src` dengan satu `read_vectored`.
    ///
    /// Writable area diisi dulu; sisanya masuk ke scratch 64KB di stack lalu
    /// di-append, jadi satu syscall bisa menerima data lebih banyak dari
    /// ruang yang sedang tersedia tanpa pre-size buffer.
    pub fn read_from<R: Read + ?Sized>(&mut self, src: &mut R) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_READ_SIZE];
        let writable = self.writable_bytes();
        let n = {
            let (_, tail) = self.buf.split_at_mut(self.writer_index);
            let mut iov = [IoSliceMut::new(tail), IoSliceMut::new(&mut extra)];
            // Scratch tidak dipakai kalau writable area sudah >= 64KB
            let iovcnt = if writable < EXTRA_READ_SIZE { 2 } else { 1 };
            src.read_vectored(&mut iov[..iovcnt])?
        };
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }
}
