//! The narinfo text format.
//!
//! A narinfo is a small `Key: Value` descriptor mapping a store path
//! to its NAR location, hashes, size, references and signatures. The
//! serialized key order is fixed and must survive a parse/format
//! round trip byte-exactly.

use std::fmt;

use thiserror::Error;

/// Where store paths live. Depot only serves the standard location.
pub const STORE_DIR: &str = "/nix/store";

/// The nixbase32 alphabet: 0-9 and a-z without e, o, t, u.
const NIXBASE32_ALPHABET: &str = "0123456789abcdfghijklmnpqrsvwxyz";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NarInfoError {
    #[error("invalid narinfo line: {0}")]
    InvalidLine(String),

    #[error("unknown narinfo field: {0}")]
    UnknownField(String),

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NarInfo {
    pub store_path: String,
    pub url: String,
    pub compression: String,
    pub file_hash: Option<String>,
    pub file_size: Option<u64>,
    pub nar_hash: String,
    pub nar_size: u64,
    /// Store path basenames, space-separated on the wire.
    pub references: Vec<String>,
    pub deriver: Option<String>,
    /// `{keyname}:{base64 signature}` lines, one per signer.
    pub signatures: Vec<String>,
    pub ca: Option<String>,
}

impl NarInfo {
    pub fn parse(input: &str) -> Result<Self, NarInfoError> {
        let mut ni = NarInfo::default();
        let mut saw_nar_hash = false;
        let mut saw_nar_size = false;

        for line in input.lines() {
            if line.is_empty() {
                continue;
            }
            let (field, value) = line
                .split_once(": ")
                .ok_or_else(|| NarInfoError::InvalidLine(line.to_string()))?;
            match field {
                "StorePath" => ni.store_path = value.to_string(),
                "URL" => ni.url = value.to_string(),
                "Compression" => ni.compression = value.to_string(),
                "FileHash" => ni.file_hash = Some(value.to_string()),
                "FileSize" => {
                    ni.file_size = Some(value.parse().map_err(|_| NarInfoError::InvalidValue {
                        field: "FileSize",
                        value: value.to_string(),
                    })?)
                }
                "NarHash" => {
                    ni.nar_hash = value.to_string();
                    saw_nar_hash = true;
                }
                "NarSize" => {
                    ni.nar_size = value.parse().map_err(|_| NarInfoError::InvalidValue {
                        field: "NarSize",
                        value: value.to_string(),
                    })?;
                    saw_nar_size = true;
                }
                "References" => {
                    ni.references = value.split_whitespace().map(str::to_string).collect();
                }
                "Deriver" => ni.deriver = Some(value.to_string()),
                "Sig" => ni.signatures.push(value.to_string()),
                "CA" => ni.ca = Some(value.to_string()),
                other => return Err(NarInfoError::UnknownField(other.to_string())),
            }
        }

        if ni.store_path.is_empty() {
            return Err(NarInfoError::MissingField("StorePath"));
        }
        if ni.url.is_empty() {
            return Err(NarInfoError::MissingField("URL"));
        }
        if !saw_nar_hash {
            return Err(NarInfoError::MissingField("NarHash"));
        }
        if !saw_nar_size {
            return Err(NarInfoError::MissingField("NarSize"));
        }

        Ok(ni)
    }

    /// The canonical byte string covered by `Sig` lines:
    /// `1;{store path};{nar hash};{nar size};{comma-joined refs}`,
    /// with references expanded to absolute store paths.
    pub fn fingerprint(&self) -> String {
        let refs: Vec<String> = self
            .references
            .iter()
            .map(|r| {
                if r.starts_with(STORE_DIR) {
                    r.clone()
                } else {
                    format!("{STORE_DIR}/{r}")
                }
            })
            .collect();
        format!(
            "1;{};{};{};{}",
            self.store_path,
            self.nar_hash,
            self.nar_size,
            refs.join(",")
        )
    }

    pub fn content_type(&self) -> &'static str {
        "text/x-nix-narinfo"
    }

    /// Hash part of the store path, e.g.
    /// `16hvpw4b3r05girazh4rnwbw0jgjkb4l` for
    /// `/nix/store/16hvpw4b3r05girazh4rnwbw0jgjkb4l-sl-5.05`.
    pub fn hash_part(&self) -> &str {
        hash_part_of(&self.store_path)
    }
}

impl fmt::Display for NarInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "StorePath: {}", self.store_path)?;
        writeln!(f, "URL: {}", self.url)?;
        writeln!(f, "Compression: {}", self.compression)?;
        if let Some(file_hash) = &self.file_hash {
            writeln!(f, "FileHash: {file_hash}")?;
        }
        if let Some(file_size) = self.file_size {
            writeln!(f, "FileSize: {file_size}")?;
        }
        writeln!(f, "NarHash: {}", self.nar_hash)?;
        writeln!(f, "NarSize: {}", self.nar_size)?;
        writeln!(f, "References: {}", self.references.join(" "))?;
        if let Some(deriver) = &self.deriver {
            writeln!(f, "Deriver: {deriver}")?;
        }
        for sig in &self.signatures {
            writeln!(f, "Sig: {sig}")?;
        }
        if let Some(ca) = &self.ca {
            writeln!(f, "CA: {ca}")?;
        }
        Ok(())
    }
}

/// Extract the hash part from a store path or store path basename.
pub fn hash_part_of(store_path: &str) -> &str {
    let base = store_path.rsplit('/').next().unwrap_or(store_path);
    base.split('-').next().unwrap_or(base)
}

/// Whether `s` consists solely of nixbase32 characters. Guards hash
/// parts before they are used as storage path segments.
pub fn is_valid_hash_part(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| NIXBASE32_ALPHABET.contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "StorePath: /nix/store/16hvpw4b3r05girazh4rnwbw0jgjkb4l-sl-5.05\n\
URL: nar/0v1p2gdn5kv7rycpqrgvzrhb5vc8j0hjhfyvvbi8csbqsgaslxjc.nar.xz\n\
Compression: xz\n\
FileHash: sha256:0v1p2gdn5kv7rycpqrgvzrhb5vc8j0hjhfyvvbi8csbqsgaslxjc\n\
FileSize: 17104\n\
NarHash: sha256:1f2jryqw9nnnsr2zbrqr91nkgjba2415x92sbd8slpwez0f7xvjr\n\
NarSize: 80256\n\
References: 16hvpw4b3r05girazh4rnwbw0jgjkb4l-sl-5.05 8cd5ce828d5d1d16feff37340171a98fc3bf6526-glibc-2.39\n\
Deriver: y1zf9xdqzlsr3sbvlqfa6mdrwjgnkfkv-sl-5.05.drv\n\
Sig: cache.nixos.org-1:WzhkqDdkgPz7qV/0O+0nC57LCdTzgBbs7Y6bAGRBVrIcNjHYtmvJmdAM/0aKgfSRtPYcjLQjrFkMskyqBl1cCw==\n";

    #[test]
    fn parse_format_round_trips_byte_exactly() {
        let ni = NarInfo::parse(SAMPLE).unwrap();
        assert_eq!(ni.to_string(), SAMPLE);
    }

    #[test]
    fn parse_extracts_fields() {
        let ni = NarInfo::parse(SAMPLE).unwrap();
        assert_eq!(ni.store_path, "/nix/store/16hvpw4b3r05girazh4rnwbw0jgjkb4l-sl-5.05");
        assert_eq!(ni.compression, "xz");
        assert_eq!(ni.file_size, Some(17104));
        assert_eq!(ni.nar_size, 80256);
        assert_eq!(ni.references.len(), 2);
        assert_eq!(ni.signatures.len(), 1);
        assert_eq!(ni.hash_part(), "16hvpw4b3r05girazh4rnwbw0jgjkb4l");
    }

    #[test]
    fn fingerprint_expands_references_to_store_paths() {
        let ni = NarInfo {
            store_path: "/nix/store/abc123-hello".to_string(),
            nar_hash: "sha256:deadbeef".to_string(),
            nar_size: 12345,
            references: vec!["dep1-foo".to_string(), "dep2-bar".to_string()],
            ..NarInfo::default()
        };
        assert_eq!(
            ni.fingerprint(),
            "1;/nix/store/abc123-hello;sha256:deadbeef;12345;/nix/store/dep1-foo,/nix/store/dep2-bar"
        );
    }

    #[test]
    fn fingerprint_with_no_references_has_empty_tail() {
        let ni = NarInfo {
            store_path: "/nix/store/abc123-hello".to_string(),
            nar_hash: "sha256:deadbeef".to_string(),
            nar_size: 12345,
            ..NarInfo::default()
        };
        assert_eq!(ni.fingerprint(), "1;/nix/store/abc123-hello;sha256:deadbeef;12345;");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = NarInfo::parse("StorePath: /nix/store/x-y\nBogus: 1\n").unwrap_err();
        assert_eq!(err, NarInfoError::UnknownField("Bogus".to_string()));
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        let err = NarInfo::parse("URL: nar/x.nar\nNarHash: sha256:x\nNarSize: 1\n").unwrap_err();
        assert_eq!(err, NarInfoError::MissingField("StorePath"));
    }

    #[test]
    fn hash_part_validation_uses_the_nix_alphabet() {
        assert!(is_valid_hash_part("16hvpw4b3r05girazh4rnwbw0jgjkb4l"));
        // e, o, t and u are not in the alphabet.
        assert!(!is_valid_hash_part("16hvpw4b3r05girazh4rnwbw0jgjkbe4"));
        assert!(!is_valid_hash_part("hello"));
        assert!(!is_valid_hash_part(""));
        assert!(!is_valid_hash_part("../../../../etc/passwd"));
    }
}
