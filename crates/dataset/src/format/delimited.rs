//! Delimited text (CSV and friends)
//!
//! One record per line. Fields holding the delimiter or a quote are wrapped
//! in double quotes with inner quotes doubled. Line breaks inside fields are
//! rejected on write so that any `\n` is a record boundary. Blank lines are
//! skipped on read, so a row made of one empty field is written as `""`.

use crate::dataset::{PartitionData, Row};
use crate::error::{DatasetError, Result};
use crate::lines::split_lines;
use crate::options::Options;

use super::FormatCodec;

const NAME: &str = "delimited";

#[derive(Debug, Clone, Copy)]
pub struct DelimitedCodec {
    default_delimiter: u8,
    extension: &'static str,
}

impl DelimitedCodec {
    /// Comma-separated, `.csv`
    pub fn csv() -> Self {
        Self {
            default_delimiter: b',',
            extension: "csv",
        }
    }

    /// Tab-separated unless a `delimiter` option says otherwise, `.txt`
    pub fn text() -> Self {
        Self {
            default_delimiter: b'\t',
            extension: "txt",
        }
    }

    fn encode_field(field: &str, delimiter: u8, out: &mut Vec<u8>) -> Result<()> {
        if field.contains(['\n', '\r']) {
            return Err(DatasetError::format(
                NAME,
                format!("field {field:?} contains a line break"),
            ));
        }
        let needs_quotes = field.bytes().any(|b| b == delimiter || b == b'"')
            || field.starts_with(' ')
            || field.ends_with(' ');
        if !needs_quotes {
            out.extend_from_slice(field.as_bytes());
            return Ok(());
        }
        out.push(b'"');
        for b in field.bytes() {
            if b == b'"' {
                out.push(b'"');
            }
            out.push(b);
        }
        out.push(b'"');
        Ok(())
    }

    fn encode_record(fields: &[String], delimiter: u8, out: &mut Vec<u8>) -> Result<()> {
        if let [only] = fields {
            if only.is_empty() {
                out.extend_from_slice(b"\"\"\n");
                return Ok(());
            }
        }
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                out.push(delimiter);
            }
            Self::encode_field(field, delimiter, out)?;
        }
        out.push(b'\n');
        Ok(())
    }

    /// Split one line into fields, honouring double quotes
    fn parse_record(line: &str, delimiter: u8) -> Result<Row> {
        let delimiter = char::from(delimiter);
        let mut fields = Vec::new();
        let mut field = String::new();
        let mut chars = line.chars().peekable();
        let mut in_quotes = false;
        let mut was_quoted = false;

        while let Some(c) = chars.next() {
            if in_quotes {
                match c {
                    '"' if chars.peek() == Some(&'"') => {
                        chars.next();
                        field.push('"');
                    }
                    '"' => in_quotes = false,
                    _ => field.push(c),
                }
                continue;
            }
            match c {
                '"' if field.is_empty() && !was_quoted => {
                    in_quotes = true;
                    was_quoted = true;
                }
                c if c == delimiter => {
                    fields.push(std::mem::take(&mut field));
                    was_quoted = false;
                }
                _ => field.push(c),
            }
        }
        if in_quotes {
            return Err(DatasetError::format(
                NAME,
                format!("unterminated quote in line {line:?}"),
            ));
        }
        fields.push(field);
        Ok(fields)
    }
}

impl Default for DelimitedCodec {
    fn default() -> Self {
        Self::csv()
    }
}

impl FormatCodec for DelimitedCodec {
    fn name(&self) -> &'static str {
        NAME
    }

    fn extension(&self) -> &'static str {
        self.extension
    }

    fn line_oriented(&self) -> bool {
        true
    }

    fn encode(&self, columns: &[String], rows: &[Row], options: &Options) -> Result<Vec<u8>> {
        let delimiter = options.delimiter(self.default_delimiter)?;
        let mut out = Vec::new();
        if options.header()? {
            Self::encode_record(columns, delimiter, &mut out)?;
        }
        for row in rows {
            Self::encode_record(row, delimiter, &mut out)?;
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8], options: &Options) -> Result<PartitionData> {
        let lines = split_lines(bytes, 0)?;
        self.decode_lines(&lines, true, options)
    }

    fn decode_lines(
        &self,
        lines: &[String],
        at_object_start: bool,
        options: &Options,
    ) -> Result<PartitionData> {
        let delimiter = options.delimiter(self.default_delimiter)?;
        let mut lines = lines.iter().filter(|line| !line.is_empty());

        let columns = if at_object_start && options.header()? {
            lines
                .next()
                .map(|line| Self::parse_record(line, delimiter))
                .transpose()?
        } else {
            None
        };
        let rows = lines
            .map(|line| Self::parse_record(line, delimiter))
            .collect::<Result<Vec<_>>>()?;
        Ok(PartitionData { columns, rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_header_and_rows() {
        let codec = DelimitedCodec::csv();
        let options = Options::new().with("header", true);
        let bytes = codec
            .encode(
                &strings(&["language", "user"]),
                &[strings(&["Java", "20000"]), strings(&["Scala", "3000"])],
                &options,
            )
            .unwrap();
        assert_eq!(bytes, b"language,user\nJava,20000\nScala,3000\n");

        let decoded = codec.decode(&bytes, &options).unwrap();
        assert_eq!(decoded.columns, Some(strings(&["language", "user"])));
        assert_eq!(decoded.rows.len(), 2);
    }

    #[test]
    fn test_quoting() {
        let codec = DelimitedCodec::csv();
        let row = strings(&["a,b", "say \"hi\"", "", " padded "]);
        let bytes = codec.encode(&[], &[row.clone()], &Options::new()).unwrap();
        assert_eq!(bytes, b"\"a,b\",\"say \"\"hi\"\"\",,\" padded \"\n");
        assert_eq!(codec.decode(&bytes, &Options::new()).unwrap().rows, vec![row]);
    }

    #[test]
    fn test_single_empty_field_survives() {
        let codec = DelimitedCodec::csv();
        let options = Options::new().with("header", true);
        let rows = vec![strings(&["a"]), strings(&[""]), strings(&["b"])];
        let bytes = codec.encode(&strings(&["value"]), &rows, &options).unwrap();
        assert_eq!(bytes, b"value\na\n\"\"\nb\n");

        let decoded = codec.decode(&bytes, &options).unwrap();
        assert_eq!(decoded.rows, rows);
    }

    #[test]
    fn test_line_breaks_rejected() {
        let codec = DelimitedCodec::csv();
        let err = codec
            .encode(&[], &[strings(&["two\nlines"])], &Options::new())
            .unwrap_err();
        assert!(matches!(err, DatasetError::Format { .. }));
    }

    #[test]
    fn test_unterminated_quote() {
        let err = DelimitedCodec::parse_record("\"open,1", b',').unwrap_err();
        assert!(matches!(err, DatasetError::Format { .. }));
    }

    #[test]
    fn test_custom_delimiter_and_blank_lines() {
        let codec = DelimitedCodec::text();
        let lines = strings(&["x\ty", "", "1\t2"]);
        let decoded = codec.decode_lines(&lines, false, &Options::new()).unwrap();
        assert_eq!(decoded.columns, None);
        assert_eq!(decoded.rows, vec![strings(&["x", "y"]), strings(&["1", "2"])]);

        let options = Options::new().with("delimiter", "|");
        let decoded = codec.decode_lines(&strings(&["a|b"]), false, &options).unwrap();
        assert_eq!(decoded.rows, vec![strings(&["a", "b"])]);
    }

    #[test]
    fn test_header_only_read_at_object_start() {
        let codec = DelimitedCodec::csv();
        let options = Options::new().with("header", "true");
        let lines = strings(&["k,v", "a,1"]);
        assert_eq!(codec.decode_lines(&lines, false, &options).unwrap().rows.len(), 2);
        assert_eq!(codec.decode_lines(&lines, true, &options).unwrap().rows.len(), 1);
    }
}
