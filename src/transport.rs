//! `multipart/x-mixed-replace` framing for the composite sequence.

use std::io::{self, Write};

pub const BOUNDARY: &str = "frame";

/// Content type to announce for a stream written by [`MjpegWriter`].
pub fn content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={}", BOUNDARY)
}

/// Writes each JPEG as one part of an MJPEG multipart stream.
pub struct MjpegWriter<W: Write> {
    inner: W,
    parts: u64,
}

impl<W: Write> MjpegWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, parts: 0 }
    }

    pub fn write_part(&mut self, jpeg: &[u8]) -> io::Result<()> {
        write!(
            self.inner,
            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            BOUNDARY,
            jpeg.len()
        )?;
        self.inner.write_all(jpeg)?;
        self.inner.write_all(b"\r\n")?;
        self.inner.flush()?;
        self.parts += 1;
        Ok(())
    }

    pub fn parts_written(&self) -> u64 {
        self.parts
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_each_part() {
        let mut writer = MjpegWriter::new(Vec::new());
        writer.write_part(&[0xFF, 0xD8, 0xFF, 0xD9]).unwrap();
        writer.write_part(&[1, 2]).unwrap();
        assert_eq!(writer.parts_written(), 2);

        let out = writer.into_inner();
        let mut expected = b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n".to_vec();
        expected.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xD9]);
        expected.extend_from_slice(b"\r\n--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 2\r\n\r\n");
        expected.extend_from_slice(&[1, 2]);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(out, expected);
    }

    #[test]
    fn announces_boundary() {
        assert_eq!(content_type(), "multipart/x-mixed-replace; boundary=frame");
    }
}
