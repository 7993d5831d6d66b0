use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Splits what the instrument sends into lines,
/// and terminates what we send with a newline.
///
/// Incoming lines have `\n` and any `\r` before it removed.
/// Bad UTF-8 is replaced, instruments are not always careful.
#[derive(Debug, Default)]
pub struct LineCodec {
    /// How far we have looked for a newline into the buffer.
    cursor: usize,
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let read_to = src.len();

        let Some(position) = src[self.cursor..read_to].iter().position(|&b| b == b'\n') else {
            // No full line yet, the next call gets the same buffer with possibly more data.
            // No need to look at these bytes again.
            self.cursor = read_to;
            return Ok(None);
        };

        let line = src.split_to(self.cursor + position);
        self.cursor = 0;

        // The newline itself.
        src.advance(1);

        let line = line.strip_suffix(b"\r").unwrap_or(&line[..]);

        Ok(Some(String::from_utf8_lossy(line).into_owned()))
    }
}

impl Encoder<&str> for LineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.extend_from_slice(item.as_bytes());
        dst.extend_from_slice(b"\n");

        Ok(())
    }
}
