//! Program loader
//!
//! The kernel hands a loader a [`LoadTarget`]: the process's user page table,
//! the frame allocator and physical memory. A loader may throw away the old
//! image, map fresh pages and fill them, then report the new layout and the
//! initial register state. It must decide whether the image fits before it
//! releases anything; once the old image is gone a failure can only be
//! reported as [`LoadStatus::MustTerminate`].

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::UserContext;
use crate::config::{page_down, page_up, user_page, PAGE_SHIFT, PAGE_SIZE, USER_PAGES, VMEM_1_BASE, VMEM_1_LIMIT, WORD_SIZE};
use crate::mach_vm::{FrameAllocator, PageTable, VmError, VmProt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Success,
    /// Nothing was changed; the caller sees an error
    Error,
    /// The old image is gone; the process cannot continue
    MustTerminate,
}

/// Address-space bounds of a loaded image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Layout {
    pub data_end: usize,
    pub brk: usize,
    pub stack_low: usize,
}

/// What a loader may touch
pub struct LoadTarget<'a> {
    frames: &'a mut FrameAllocator,
    memory: &'a mut [u8],
    table: &'a mut PageTable,
    layout: Layout,
    uctx: UserContext,
}

impl<'a> LoadTarget<'a> {
    pub fn new(
        frames: &'a mut FrameAllocator,
        memory: &'a mut [u8],
        table: &'a mut PageTable,
        layout: Layout,
        uctx: UserContext,
    ) -> Self {
        Self {
            frames,
            memory,
            table,
            layout,
            uctx,
        }
    }

    pub fn free_frames(&self) -> usize {
        self.frames.free_frames()
    }

    /// Pages currently mapped in the user region
    pub fn mapped_pages(&self) -> usize {
        self.table.valid_count()
    }

    /// Drop the whole old image
    pub fn release_all(&mut self) {
        self.frames.deallocate(self.table, 0, USER_PAGES);
    }

    /// Map zeroed pages covering `[va, va + len)`
    pub fn map(&mut self, va: usize, len: usize, prot: VmProt) -> Result<(), VmError> {
        if va < VMEM_1_BASE || len > VMEM_1_LIMIT - va.min(VMEM_1_LIMIT) {
            return Err(VmError::BadRange);
        }
        let first = user_page(page_down(va));
        let count = (page_up(va + len) - page_down(va)) >> PAGE_SHIFT;
        self.frames.allocate(self.table, first, count, prot)?;
        for slot in first..first + count {
            let pfn = self.table.get(slot).map(|pte| pte.pfn).ok_or(VmError::NotMapped)?;
            let frame = pfn << PAGE_SHIFT;
            self.memory
                .get_mut(frame..frame + PAGE_SIZE)
                .ok_or(VmError::BadFrame)?
                .fill(0);
        }
        Ok(())
    }

    /// Store bytes at a mapped user address, ignoring protection
    pub fn write(&mut self, va: usize, bytes: &[u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < bytes.len() {
            let at = va + done;
            let chunk = (PAGE_SIZE - (at & (PAGE_SIZE - 1))).min(bytes.len() - done);
            let pa = self
                .table
                .translate(VMEM_1_BASE, at, VmProt::empty())
                .ok_or(VmError::NotMapped)?;
            self.memory
                .get_mut(pa..pa + chunk)
                .ok_or(VmError::BadFrame)?
                .copy_from_slice(&bytes[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    pub fn write_word(&mut self, va: usize, value: u32) -> Result<(), VmError> {
        self.write(va, &value.to_le_bytes())
    }

    pub fn set_layout(&mut self, layout: Layout) {
        self.layout = layout;
    }

    pub fn set_entry(&mut self, pc: usize, sp: usize) {
        self.uctx.pc = pc;
        self.uctx.sp = sp;
    }

    pub fn set_reg(&mut self, index: usize, value: usize) {
        if let Some(reg) = self.uctx.regs.get_mut(index) {
            *reg = value;
        }
    }

    pub fn finish(self) -> (Layout, UserContext) {
        (self.layout, self.uctx)
    }
}

/// Something that can replace a process image
pub trait ProgramLoader {
    fn load(&mut self, path: &str, argv: &[String], target: &mut LoadTarget<'_>) -> LoadStatus;
}

// ============================================================================
// In-memory images
// ============================================================================

/// A flat program: text, initialized data and zero-filled data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramImage {
    pub text: Vec<u8>,
    pub data: Vec<u8>,
    pub bss: usize,
    /// Offset of the first instruction within the text
    pub entry: usize,
}

impl ProgramImage {
    pub fn new(text: &[u8]) -> Self {
        Self {
            text: text.to_vec(),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: &[u8]) -> Self {
        self.data = data.to_vec();
        self
    }

    pub fn with_bss(mut self, bss: usize) -> Self {
        self.bss = bss;
        self
    }

    pub fn with_entry(mut self, offset: usize) -> Self {
        self.entry = offset;
        self
    }
}

/// Planned placement of an image and its arguments
struct Plan {
    text_pages: usize,
    data_start: usize,
    data_end: usize,
    brk: usize,
    argv_va: usize,
    strings_va: usize,
    sp: usize,
    stack_low: usize,
}

impl Plan {
    fn new(image: &ProgramImage, argv: &[String]) -> Option<Self> {
        let text_pages = (page_up(image.text.len()) >> PAGE_SHIFT).max(1);
        let data_start = VMEM_1_BASE + (text_pages << PAGE_SHIFT);
        let data_end = data_start
            .checked_add(image.data.len())?
            .checked_add(image.bss)?;
        let strings_len: usize = argv.iter().map(|a| a.len() + 1).sum();
        let strings_va = VMEM_1_LIMIT.checked_sub(strings_len)? & !(WORD_SIZE - 1);
        let argv_va = strings_va.checked_sub((argv.len() + 1) * WORD_SIZE)?;
        let sp = argv_va.checked_sub(WORD_SIZE)?;
        Some(Self {
            text_pages,
            data_start,
            data_end,
            brk: page_up(data_end),
            argv_va,
            strings_va,
            sp,
            stack_low: page_down(sp),
        })
    }

    fn pages(&self) -> usize {
        let data = (self.brk - self.data_start) >> PAGE_SHIFT;
        let stack = (VMEM_1_LIMIT - self.stack_low) >> PAGE_SHIFT;
        self.text_pages + data + stack
    }
}

/// Loader over a table of named in-memory images
///
/// Text is mapped read/execute at the bottom of the user region, data
/// read/write right after it, and the argument strings, the argument vector
/// and `argc` sit at the top of the stack. The process starts with `argc` in
/// `regs[0]` and the vector's address in `regs[1]`.
#[derive(Debug, Clone, Default)]
pub struct ImageLoader {
    images: BTreeMap<String, ProgramImage>,
}

impl ImageLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, path: &str, image: ProgramImage) -> Self {
        self.install(path, image);
        self
    }

    pub fn install(&mut self, path: &str, image: ProgramImage) {
        self.images.insert(String::from(path), image);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.images.contains_key(path)
    }

    fn populate(image: &ProgramImage, argv: &[String], plan: &Plan, target: &mut LoadTarget<'_>) -> Result<(), VmError> {
        target.map(VMEM_1_BASE, plan.text_pages << PAGE_SHIFT, VmProt::RX)?;
        target.write(VMEM_1_BASE, &image.text)?;
        if plan.brk > plan.data_start {
            target.map(plan.data_start, plan.brk - plan.data_start, VmProt::RW)?;
            target.write(plan.data_start, &image.data)?;
        }
        target.map(plan.stack_low, VMEM_1_LIMIT - plan.stack_low, VmProt::RW)?;

        let mut string_at = plan.strings_va;
        for (i, arg) in argv.iter().enumerate() {
            target.write(string_at, arg.as_bytes())?;
            target.write(string_at + arg.len(), &[0])?;
            target.write_word(plan.argv_va + i * WORD_SIZE, string_at as u32)?;
            string_at += arg.len() + 1;
        }
        target.write_word(plan.argv_va + argv.len() * WORD_SIZE, 0)?;
        target.write_word(plan.sp, argv.len() as u32)?;

        target.set_layout(Layout {
            data_end: plan.data_end,
            brk: plan.brk,
            stack_low: plan.stack_low,
        });
        target.set_entry(VMEM_1_BASE + image.entry, plan.sp);
        target.set_reg(0, argv.len());
        target.set_reg(1, plan.argv_va);
        Ok(())
    }
}

impl ProgramLoader for ImageLoader {
    fn load(&mut self, path: &str, argv: &[String], target: &mut LoadTarget<'_>) -> LoadStatus {
        let Some(image) = self.images.get(path) else {
            ktrace!(1, "loader: no image {}", path);
            return LoadStatus::Error;
        };
        let Some(plan) = Plan::new(image, argv) else {
            ktrace!(1, "loader: {}: arguments do not fit", path);
            return LoadStatus::Error;
        };
        if plan.brk + PAGE_SIZE > plan.stack_low {
            ktrace!(1, "loader: {}: image overlaps the stack", path);
            return LoadStatus::Error;
        }
        if plan.pages() > target.free_frames() + target.mapped_pages() {
            ktrace!(1, "loader: {}: needs {} frames", path, plan.pages());
            return LoadStatus::Error;
        }

        target.release_all();
        match Self::populate(image, argv, &plan, target) {
            Ok(()) => {
                ktrace!(2, "loader: {} loaded, {} pages, brk {:#x}", path, plan.pages(), plan.brk);
                LoadStatus::Success
            }
            Err(err) => {
                ktrace!(0, "loader: {}: {} after release", path, err);
                LoadStatus::MustTerminate
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|a| String::from(*a)).collect()
    }

    fn read(memory: &[u8], table: &PageTable, va: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        crate::kern::copyio::copyin(memory, table, va, &mut out).unwrap();
        out
    }

    #[test]
    fn test_layout_and_arguments() {
        let mut frames = FrameAllocator::new(32);
        let mut memory = vec![0u8; 32 * PAGE_SIZE];
        let mut table = PageTable::new(USER_PAGES);
        let mut loader = ImageLoader::new().with_image(
            "prog",
            ProgramImage::new(b"\x01\x02").with_data(b"data").with_bss(16),
        );
        let argv = args(&["prog", "-v"]);
        let mut target = LoadTarget::new(&mut frames, &mut memory, &mut table, Layout::default(), UserContext::default());
        assert_eq!(loader.load("prog", &argv, &mut target), LoadStatus::Success);
        let (layout, uctx) = target.finish();

        assert_eq!(layout.data_end, VMEM_1_BASE + PAGE_SIZE + 20);
        assert_eq!(layout.brk, VMEM_1_BASE + 2 * PAGE_SIZE);
        assert_eq!(layout.stack_low, VMEM_1_LIMIT - PAGE_SIZE);
        assert_eq!(table.valid_count(), 3);
        assert_eq!(table.get(0).unwrap().prot, VmProt::RX);
        assert_eq!(uctx.pc, VMEM_1_BASE);
        assert_eq!(uctx.regs[0], 2);

        let argc = crate::kern::copyio::fuword32(&memory, &table, uctx.sp).unwrap();
        assert_eq!(argc, 2);
        let argv0 = crate::kern::copyio::fuword32(&memory, &table, uctx.regs[1]).unwrap() as usize;
        assert_eq!(crate::kern::copyio::copyinstr(&memory, &table, argv0).unwrap(), "prog");
        assert_eq!(read(&memory, &table, layout.brk - PAGE_SIZE, 4), b"data");
    }

    #[test]
    fn test_missing_or_oversized_image_changes_nothing() {
        let mut frames = FrameAllocator::new(4);
        let mut memory = vec![0u8; 4 * PAGE_SIZE];
        let mut table = PageTable::new(USER_PAGES);
        let mut loader = ImageLoader::new().with_image("big", ProgramImage::new(&vec![0u8; 4 * PAGE_SIZE]));
        let mut target = LoadTarget::new(&mut frames, &mut memory, &mut table, Layout::default(), UserContext::default());
        assert_eq!(loader.load("none", &[], &mut target), LoadStatus::Error);
        assert_eq!(loader.load("big", &[], &mut target), LoadStatus::Error);
        assert_eq!(target.free_frames(), 4);
    }

    #[test]
    fn test_reload_reuses_old_frames() {
        let mut frames = FrameAllocator::new(3);
        let mut memory = vec![0u8; 3 * PAGE_SIZE];
        let mut table = PageTable::new(USER_PAGES);
        let mut loader = ImageLoader::new().with_image("p", ProgramImage::new(b"x").with_bss(1));
        let mut target = LoadTarget::new(&mut frames, &mut memory, &mut table, Layout::default(), UserContext::default());
        assert_eq!(loader.load("p", &[], &mut target), LoadStatus::Success);
        assert_eq!(target.free_frames(), 0);
        assert_eq!(loader.load("p", &[], &mut target), LoadStatus::Success);
        assert_eq!(target.mapped_pages(), 3);
    }
}
