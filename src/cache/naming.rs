//! On-disk block names
//!
//! Every disk block file name encodes enough to rebuild the tier map at
//! startup without a separate index:
//!
//! ```text
//!   C$7##6275636b6574#6f626a-0-1023
//!   │ │  │             │     │ └─ stop (inclusive)
//!   │ │  │             │     └─── start
//!   │ │  │             └───────── hex(key)
//!   │ │  └─────────────────────── hex(bucket)
//!   │ └────────────────────────── version
//!   └──────────────────────────── state letter (I, C, P, O, A)
//! ```
//!
//! Blocks of partial files carry a `.partial` suffix. Blocks still being
//! written carry an extra `~<uuid>` suffix so that concurrent writers never
//! collide; recovery discards them.

use super::block::BlockState;
use super::key::CacheKey;
use super::range::BlockRange;

const PARTIAL_SUFFIX: &str = ".partial";
const IN_PROGRESS_MARK: char = '~';

/// Identity of one stored block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLabel {
    pub state: BlockState,
    pub version: i64,
    pub key: CacheKey,
    pub range: BlockRange,
    pub partial: bool,
}

impl BlockLabel {
    /// Encode as a file name
    pub fn file_name(&self) -> String {
        format!(
            "{}${}##{}#{}-{}-{}{}",
            state_letter(self.state),
            self.version,
            hex::encode(self.key.bucket()),
            hex::encode(self.key.key()),
            self.range.start,
            self.range.stop,
            if self.partial { PARTIAL_SUFFIX } else { "" },
        )
    }

    /// File name for a block that is still being written
    pub fn in_progress_name(&self, unique: &uuid::Uuid) -> String {
        format!("{}{}{}", self.file_name(), IN_PROGRESS_MARK, unique.simple())
    }

    /// Parse a file name produced by [`BlockLabel::file_name`].
    ///
    /// In-progress names and anything malformed yield `None`.
    pub fn parse(name: &str) -> Option<BlockLabel> {
        if name.contains(IN_PROGRESS_MARK) {
            return None;
        }
        let (body, partial) = match name.strip_suffix(PARTIAL_SUFFIX) {
            Some(body) => (body, true),
            None => (name, false),
        };

        let (head, tail) = body.split_once("##")?;
        let (letter, version) = head.split_once('$')?;
        let state = parse_state_letter(letter)?;
        let version: i64 = version.parse().ok()?;

        let (bucket_hex, rest) = tail.split_once('#')?;
        let mut parts = rest.splitn(3, '-');
        let key_hex = parts.next()?;
        let start: i64 = parts.next()?.parse().ok()?;
        let stop: i64 = parts.next()?.parse().ok()?;
        if stop < start || start < 0 {
            return None;
        }

        let bucket = String::from_utf8(hex::decode(bucket_hex).ok()?).ok()?;
        let key = String::from_utf8(hex::decode(key_hex).ok()?).ok()?;

        Some(BlockLabel {
            state,
            version,
            key: CacheKey::new(bucket, key),
            range: BlockRange::new(start, stop),
            partial,
        })
    }
}

fn state_letter(state: BlockState) -> char {
    match state {
        BlockState::Incomplete => 'I',
        BlockState::Complete => 'C',
        BlockState::Pushed => 'P',
        BlockState::Obsolete => 'O',
        BlockState::Aborted => 'A',
    }
}

fn parse_state_letter(letter: &str) -> Option<BlockState> {
    match letter {
        "I" => Some(BlockState::Incomplete),
        "C" => Some(BlockState::Complete),
        "P" => Some(BlockState::Pushed),
        "O" => Some(BlockState::Obsolete),
        "A" => Some(BlockState::Aborted),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn label(state: BlockState, partial: bool) -> BlockLabel {
        BlockLabel {
            state,
            version: 7,
            key: CacheKey::new("bucket", "dir/obj-1.bin"),
            range: BlockRange::new(0, 1023),
            partial,
        }
    }

    #[test]
    fn test_file_name_layout() {
        let name = label(BlockState::Complete, false).file_name();
        assert_eq!(
            name,
            format!(
                "C$7##{}#{}-0-1023",
                hex::encode("bucket"),
                hex::encode("dir/obj-1.bin")
            )
        );
    }

    #[test]
    fn test_parse_recovers_partial_pushed_block() {
        let original = label(BlockState::Pushed, true);
        let parsed = BlockLabel::parse(&original.file_name()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_in_progress_names_are_not_parsed() {
        let unique = uuid::Uuid::new_v4();
        let name = label(BlockState::Incomplete, false).in_progress_name(&unique);
        assert!(BlockLabel::parse(&name).is_none());
    }

    #[test]
    fn test_malformed_names_are_rejected() {
        assert!(BlockLabel::parse("").is_none());
        assert!(BlockLabel::parse("lost+found").is_none());
        assert!(BlockLabel::parse("X$1##62#6b-0-1").is_none());
        assert!(BlockLabel::parse("C$abc##62#6b-0-1").is_none());
        assert!(BlockLabel::parse("C$1##zz#6b-0-1").is_none());
        assert!(BlockLabel::parse("C$1##62#6b-10-1").is_none());
    }
}
