//! Named byte sections and the reserved section ids.
//!
//! Every value ultimately lives at some `(section, offset)` address, so
//! the stack/heap split is expressed here as distinct [`Section`]s
//! rather than as distinct storage classes.

use std::collections::HashMap;

pub type SectionId = u64;

/// The user-supplied data source, offset by a base address and bounded by
/// a configured size.
pub const MAIN: SectionId = 0;
/// A process-lifetime growable buffer backing locals with composite type.
pub const HEAP: SectionId = u64::MAX;
/// Per-pattern scratch storage, addressed by a 32-bit pattern id packed
/// into the upper half of the offset.
pub const PATTERN_LOCAL: SectionId = u64::MAX - 1;

/// A contiguous, optionally-writable byte store.
pub trait Section: std::fmt::Debug {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), String>;
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<(), String>;
    fn is_writable(&self) -> bool;
    fn len(&self) -> u64;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A section backed by a host read/write callback pair, used for `MAIN`:
/// the evaluator never owns the real data source, only a view onto it
/// through a configured base address and size.
pub struct CallbackSection {
    base_address: u64,
    size: u64,
    reader: Box<dyn Fn(u64, &mut [u8]) + Send + Sync>,
    writer: Option<Box<dyn Fn(u64, &[u8]) + Send + Sync>>,
}

impl std::fmt::Debug for CallbackSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSection")
            .field("base_address", &self.base_address)
            .field("size", &self.size)
            .field("writable", &self.writer.is_some())
            .finish()
    }
}

impl CallbackSection {
    pub fn new(
        base_address: u64,
        size: u64,
        reader: impl Fn(u64, &mut [u8]) + Send + Sync + 'static,
        writer: Option<Box<dyn Fn(u64, &[u8]) + Send + Sync>>,
    ) -> Self {
        Self {
            base_address,
            size,
            reader: Box::new(reader),
            writer,
        }
    }

    pub fn base_address(&self) -> u64 {
        self.base_address
    }
}

impl Section for CallbackSection {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), String> {
        if offset.saturating_add(buf.len() as u64) > self.size {
            // Out-of-bounds reads are zero-filled rather than rejected;
            // the host data source may legitimately be shorter than a
            // speculative struct layout probes.
            buf.fill(0);
            return Ok(());
        }
        (self.reader)(self.base_address + offset, buf);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<(), String> {
        match &self.writer {
            Some(writer) => {
                if offset.saturating_add(buf.len() as u64) > self.size {
                    return Err(format!(
                        "write of {} bytes at offset {offset} exceeds section size {}",
                        buf.len(),
                        self.size
                    ));
                }
                writer(self.base_address + offset, buf);
                Ok(())
            }
            None => Err("section is read-only".into()),
        }
    }

    fn is_writable(&self) -> bool {
        self.writer.is_some()
    }

    fn len(&self) -> u64 {
        self.size
    }
}

/// A plain growable buffer, used for `HEAP` and user-defined sections.
#[derive(Debug, Default)]
pub struct BufferSection {
    data: Vec<u8>,
}

impl BufferSection {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_len(&mut self, len: usize) {
        if self.data.len() < len {
            self.data.resize(len, 0);
        }
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

impl Section for BufferSection {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), String> {
        let start = offset as usize;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.data.get(start + i).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<(), String> {
        let start = offset as usize;
        self.ensure_len(start + buf.len());
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// The registry mapping section ids to their backing store.
///
/// `HEAP` is kept as a dedicated field rather than behind the `dyn Section`
/// map: scope unwinding must truncate it directly, and a
/// trait object has no safe way back to its concrete type without anyone
/// reaching for `std::any::Any` machinery the rest of this codebase
/// doesn't use elsewhere. `PATTERN_LOCAL` and user sections have no such
/// requirement and stay fully dynamic.
#[derive(Debug)]
pub struct SectionTable {
    heap: BufferSection,
    sections: HashMap<SectionId, Box<dyn Section>>,
    next_user_id: SectionId,
}

impl Default for SectionTable {
    fn default() -> Self {
        let mut sections: HashMap<SectionId, Box<dyn Section>> = HashMap::new();
        sections.insert(PATTERN_LOCAL, Box::new(BufferSection::new()));
        Self {
            heap: BufferSection::new(),
            sections,
            next_user_id: 1,
        }
    }
}

impl SectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_main(&mut self, section: CallbackSection) {
        self.sections.insert(MAIN, Box::new(section));
    }

    /// Allocate a fresh user section (numbered from 1 upward) and return
    /// its id.
    pub fn create_user_section(&mut self) -> SectionId {
        let id = self.next_user_id;
        self.next_user_id += 1;
        self.sections.insert(id, Box::new(BufferSection::new()));
        id
    }

    pub fn get(&self, id: SectionId) -> Option<&dyn Section> {
        if id == HEAP {
            return Some(&self.heap);
        }
        self.sections.get(&id).map(|b| b.as_ref())
    }

    pub fn get_mut(&mut self, id: SectionId) -> Option<&mut (dyn Section + '_)> {
        if id == HEAP {
            return Some(&mut self.heap);
        }
        self.sections.get_mut(&id).map(|b| &mut **b as &mut dyn Section)
    }

    pub fn heap_len(&self) -> u64 {
        self.heap.len()
    }

    pub fn truncate_heap(&mut self, len: u64) {
        self.heap.truncate(len as usize);
    }

    pub fn heap_push(&mut self, bytes: &[u8]) -> u64 {
        let offset = self.heap.byte_len() as u64;
        self.heap
            .write(offset, bytes)
            .expect("heap writes never fail");
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_section_reads_past_end_as_zero() {
        let section = BufferSection::new();
        let mut buf = [0xAAu8; 4];
        section.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0]);
    }

    #[test]
    fn buffer_section_roundtrips() {
        let mut section = BufferSection::new();
        section.write(2, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        section.read(2, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn reserved_sections_are_preregistered() {
        let table = SectionTable::new();
        assert!(table.get(HEAP).is_some());
        assert!(table.get(PATTERN_LOCAL).is_some());
        assert!(table.get(MAIN).is_none());
    }
}
