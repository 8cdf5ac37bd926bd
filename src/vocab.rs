use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

const SP_SPACE: char = '\u{2581}'; // SentencePiece '▁'

/// SentencePiece-style id -> piece decoder.
///
/// Vocab file format is `token <whitespace> id` per line (spec §4.E /
/// §6). A binary `tokenizer.model` (protobuf) loader is also kept for
/// compatibility with the original Nemotron export.
pub struct Tokenizer {
    id_to_token: Vec<String>,
    blank_id: u32,
}

impl Tokenizer {
    /// Load from a plain-text vocab file: one `token<ws>id` pair per line.
    pub fn from_vocab_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .map_err(|e| Error::Tokenizer(format!("failed to open vocab file: {e}")))?;
        let reader = BufReader::new(file);

        let mut entries: HashMap<u32, String> = HashMap::new();
        let mut max_id = 0u32;
        for line in reader.lines() {
            let line = line.map_err(|e| Error::Tokenizer(format!("failed to read vocab: {e}")))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.rsplitn(2, char::is_whitespace);
            let id_str = parts
                .next()
                .ok_or_else(|| Error::Tokenizer(format!("malformed vocab line: {line}")))?;
            let token = parts
                .next()
                .ok_or_else(|| Error::Tokenizer(format!("malformed vocab line: {line}")))?;
            let id: u32 = id_str
                .parse()
                .map_err(|_| Error::Tokenizer(format!("non-integer id in vocab line: {line}")))?;
            max_id = max_id.max(id);
            entries.insert(id, token.to_string());
        }

        if entries.is_empty() {
            return Err(Error::Tokenizer("vocab file has no entries".into()));
        }

        let mut id_to_token = vec![String::new(); max_id as usize + 1];
        for (id, tok) in entries {
            id_to_token[id as usize] = tok;
        }

        let blank_id = Self::discover_blank_id(&id_to_token);
        Ok(Self {
            id_to_token,
            blank_id,
        })
    }

    /// Load a binary SentencePiece `tokenizer.model` (protobuf `ModelProto`,
    /// field 1 = `pieces`, each a length-delimited `SentencePiece` message
    /// whose field 1 is the UTF-8 piece text). Kept for parity with the
    /// original Nemotron export format.
    pub fn from_sentencepiece_model<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path.as_ref())
            .map_err(|e| Error::Tokenizer(format!("failed to open tokenizer.model: {e}")))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| Error::Tokenizer(format!("failed to read tokenizer.model: {e}")))?;
        Self::from_sentencepiece_bytes(&data)
    }

    pub fn from_sentencepiece_bytes(data: &[u8]) -> Result<Self> {
        let pieces = parse_sentencepiece_pieces(data)?;
        let blank_id = Self::discover_blank_id(&pieces);
        Ok(Self {
            id_to_token: pieces,
            blank_id,
        })
    }

    fn discover_blank_id(pieces: &[String]) -> u32 {
        pieces
            .iter()
            .position(|p| p == "<blk>")
            .map(|i| i as u32)
            .unwrap_or(pieces.len().saturating_sub(1) as u32)
    }

    pub fn blank_id(&self) -> u32 {
        self.blank_id
    }

    /// Build directly from a piece list, bypassing file I/O. Used by other
    /// modules' unit tests that need a tokenizer but not a real vocab file.
    #[cfg(test)]
    pub fn from_pieces_for_test(pieces: Vec<String>) -> Self {
        let blank_id = Self::discover_blank_id(&pieces);
        Self {
            id_to_token: pieces,
            blank_id,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn id_to_piece(&self, id: u32) -> Option<&str> {
        self.id_to_token.get(id as usize).map(|s| s.as_str())
    }

    /// Display text for a single token id, with the SentencePiece `▁`
    /// convention applied but none of `decode`'s cross-token joining rules
    /// (those need sequence context). Used by `DecoderCore` to populate a
    /// freshly emitted `Token::text`.
    pub fn piece_display(&self, id: u32) -> String {
        match self.id_to_piece(id) {
            Some(p) => p.replace(SP_SPACE, " "),
            None => String::new(),
        }
    }

    /// Decode a sequence of token ids into display text: SentencePiece `▁`
    /// becomes a space, leading space is trimmed, a space immediately
    /// before punctuation is removed, and whitespace runs collapse. Special
    /// tokens (`<...>`, except `<unk>`) are dropped.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut full_text = String::new();

        for &id in ids {
            let Some(piece) = self.id_to_piece(id) else {
                continue;
            };
            if piece.starts_with('<') && piece.ends_with('>') && piece != "<unk>" {
                continue;
            }

            let mut display = piece.replace(SP_SPACE, " ");

            if !full_text.is_empty()
                && !display.starts_with(' ')
                && display.chars().all(|c| c.is_ascii_digit())
            {
                let trailing_letters = full_text
                    .chars()
                    .rev()
                    .take_while(|c| c.is_alphabetic())
                    .count();
                let last_char = full_text.chars().last();
                let is_article_a = trailing_letters == 1 && last_char == Some('a');
                if trailing_letters > 1 || is_article_a {
                    display.insert(0, ' ');
                }
            }

            full_text.push_str(&display);
        }

        normalize_whitespace(&full_text)
    }
}

/// Trim leading/trailing whitespace, collapse interior whitespace runs to a
/// single space, and drop the space immediately preceding a punctuation
/// character. Idempotent: applying this twice gives the same result as once.
pub fn normalize_whitespace(s: &str) -> String {
    let collapsed: Vec<&str> = s.split_whitespace().collect();
    let mut out = String::new();
    for (i, word) in collapsed.iter().enumerate() {
        if i > 0 {
            let starts_with_punct = word
                .chars()
                .next()
                .map(|c| !c.is_alphanumeric())
                .unwrap_or(false);
            if !starts_with_punct {
                out.push(' ');
            }
        }
        out.push_str(word);
    }
    out
}

fn read_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut result: u64 = 0;
    let mut shift = 0;
    let mut pos = 0;
    while pos < data.len() && pos < 10 {
        let byte = data[pos];
        result |= ((byte & 0x7F) as u64) << shift;
        pos += 1;
        if byte & 0x80 == 0 {
            return Ok((result, pos));
        }
        shift += 7;
    }
    Err(Error::Tokenizer("invalid varint in tokenizer.model".into()))
}

fn parse_piece_message(data: &[u8]) -> Result<String> {
    let mut pos = 0;
    let mut piece = String::new();
    while pos < data.len() {
        let (field_header, bytes_read) = read_varint(&data[pos..])?;
        pos += bytes_read;
        let field_num = field_header >> 3;
        let wire_type = field_header & 0x7;
        match (field_num, wire_type) {
            (1, 2) => {
                let (len, bytes_read) = read_varint(&data[pos..])?;
                pos += bytes_read;
                if pos + len as usize <= data.len() {
                    piece = String::from_utf8_lossy(&data[pos..pos + len as usize]).to_string();
                }
                pos += len as usize;
            }
            (_, 0) => {
                let (_, bytes_read) = read_varint(&data[pos..])?;
                pos += bytes_read;
            }
            (_, 1) => pos += 8,
            (_, 2) => {
                let (len, bytes_read) = read_varint(&data[pos..])?;
                pos += bytes_read + len as usize;
            }
            (_, 5) => pos += 4,
            _ => break,
        }
    }
    Ok(piece)
}

fn parse_sentencepiece_pieces(data: &[u8]) -> Result<Vec<String>> {
    let mut pieces = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let (field_header, bytes_read) = read_varint(&data[pos..])?;
        pos += bytes_read;
        let field_num = field_header >> 3;
        let wire_type = field_header & 0x7;
        match (field_num, wire_type) {
            (1, 2) => {
                let (len, bytes_read) = read_varint(&data[pos..])?;
                pos += bytes_read;
                if pos + len as usize > data.len() {
                    break;
                }
                let piece_data = &data[pos..pos + len as usize];
                pos += len as usize;
                if let Ok(piece) = parse_piece_message(piece_data) {
                    pieces.push(piece);
                }
            }
            (_, 0) => {
                let (_, bytes_read) = read_varint(&data[pos..])?;
                pos += bytes_read;
            }
            (_, 1) => pos += 8,
            (_, 2) => {
                let (len, bytes_read) = read_varint(&data[pos..])?;
                pos += bytes_read + len as usize;
            }
            (_, 5) => pos += 4,
            _ => break,
        }
    }
    if pieces.is_empty() {
        return Err(Error::Tokenizer("no tokens found in tokenizer.model".into()));
    }
    Ok(pieces)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(tokens: &[&str]) -> Tokenizer {
        let id_to_token = tokens.iter().map(|s| s.to_string()).collect();
        let blank_id = Tokenizer::discover_blank_id(&id_to_token);
        Tokenizer {
            id_to_token,
            blank_id,
        }
    }

    #[test]
    fn digit_spacing_after_word() {
        let t = make(&["\u{2581}like", "1", "0", "0"]);
        assert_eq!(t.decode(&[0, 1, 2, 3]), "like 100");
    }

    #[test]
    fn digit_spacing_after_article_a() {
        let t = make(&["\u{2581}a", "2", "4"]);
        assert_eq!(t.decode(&[0, 1, 2]), "a 24");
    }

    #[test]
    fn no_spacing_after_single_uppercase() {
        let t = make(&["\u{2581}A", "4"]);
        assert_eq!(t.decode(&[0, 1]), "A4");
    }

    #[test]
    fn no_spacing_after_symbol() {
        let t = make(&["$", "1", "0", "0"]);
        assert_eq!(t.decode(&[0, 1, 2, 3]), "$100");
    }

    #[test]
    fn skips_special_tokens_but_keeps_unk() {
        let t = make(&["<s>", "\u{2581}hi", "<unk>"]);
        assert_eq!(t.decode(&[0, 1, 2]), "hi<unk>");
    }

    #[test]
    fn decode_is_whitespace_normalized_and_idempotent() {
        let s = "hello   world , there";
        let once = normalize_whitespace(s);
        let twice = normalize_whitespace(&once);
        assert_eq!(once, twice);
        assert_eq!(once, "hello world, there");
    }

    #[test]
    fn blank_id_falls_back_to_last_index() {
        let t = make(&["a", "b", "c"]);
        assert_eq!(t.blank_id(), 2);
    }

    #[test]
    fn blank_id_discovered_by_blk_token() {
        let t = make(&["<blk>", "a", "b"]);
        assert_eq!(t.blank_id(), 0);
    }
}
