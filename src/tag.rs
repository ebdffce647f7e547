//! Partitioning of the 64 bit tag space.
//!
//! ```ascii
//!  63 ..  N   N-1        N-2 .. 0
//! [reserved] [control]  [stream / ring id]
//! ```
//!
//! The provider announces the tag bits it supports through its tag format; leading zero bits of
//!  that format are reserved by the provider and must always be zero. The highest usable bit
//!  marks control messages (connection handshake), the remaining bits identify the stream. With a
//!  provider that reserves nothing, the control bit is bit 63.

use std::fmt::{Debug, Display, Formatter};

use anyhow::bail;

use crate::error::EngineError;

/// The minimum tag width the engine accepts: 2^32 streams plus the control bit
pub const MIN_TAG_BITS_FOR_RING_ID: u32 = 32 + 1;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Tag(u64);

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
impl Debug for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tag({:#x})", self.0)
    }
}

impl Tag {
    pub const fn from_raw(value: u64) -> Tag {
        Tag(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TagLayout {
    usable_bits: u32,
}

impl TagLayout {
    /// Derives the layout from a provider's tag format. Providers that reserve so many bits
    ///  that fewer than [MIN_TAG_BITS_FOR_RING_ID] remain are rejected rather than silently
    ///  running with a smaller stream id space.
    pub fn from_tag_format(tag_format: u64) -> anyhow::Result<TagLayout> {
        let usable_bits = u64::BITS - tag_format.leading_zeros();
        if usable_bits < MIN_TAG_BITS_FOR_RING_ID {
            bail!("provider supports only {} tag bits, at least {} are required", usable_bits, MIN_TAG_BITS_FOR_RING_ID);
        }
        Ok(TagLayout { usable_bits })
    }

    pub fn usable_bits(&self) -> u32 {
        self.usable_bits
    }

    pub fn control_bit(&self) -> u64 {
        1u64 << (self.usable_bits - 1)
    }

    /// the highest stream tag that can be issued
    pub fn max_tag(&self) -> u64 {
        self.control_bit() - 1
    }

    pub fn is_control(&self, tag: Tag) -> bool {
        tag.0 & self.control_bit() != 0
    }

    /// strips the control bit (and anything above it)
    pub fn stream_id(&self, tag: Tag) -> u64 {
        tag.0 & self.max_tag()
    }
}

/// Issues stream tags monotonically. Tags are never reused within an engine's lifetime, so a tag
///  can not be re-issued while requests carrying it are still outstanding.
pub struct TagAllocator {
    layout: TagLayout,
    /// last issued tag, 0 if none was issued yet
    current: u64,
}

impl TagAllocator {
    pub fn new(layout: TagLayout) -> TagAllocator {
        TagAllocator {
            layout,
            current: 0,
        }
    }

    pub fn layout(&self) -> &TagLayout {
        &self.layout
    }

    pub fn allocate_tag(&mut self) -> Result<Tag, EngineError> {
        let max_tag = self.layout.max_tag();
        if self.current >= max_tag {
            return Err(EngineError::TagSpaceExhausted { max_tag });
        }
        self.current += 1;
        Ok(Tag(self.current & max_tag))
    }

    /// The sentinel tag with only the control bit set, shared by all communicators. It is the
    ///  mask that [TagAllocator::control_tag_for] combines with a stream tag.
    pub fn control_tag(&self) -> Tag {
        Tag(self.layout.control_bit())
    }

    /// The tag for handshake messages of a given stream: the stream tag with the control bit
    ///  set, so that handshakes of different listeners on one endpoint never match each other
    pub fn control_tag_for(&self, tag: Tag) -> Tag {
        Tag(tag.0 | self.control_tag().0)
    }
}
