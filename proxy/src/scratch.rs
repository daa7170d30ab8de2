// PSP PROXY — SCRATCH SPACE ALLOCATOR
// Best-fit over the stub-reserved PSP SRAM window. Free chunks are kept
// sorted by ascending address; allocations come off the high end of the
// best-fitting chunk, frees coalesce with both neighbours. Seeded lazily
// from the scratch region the ConnectResponse advertised.

use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeChunk {
    addr: u32,
    cb: u32,
}

pub struct ScratchAllocator {
    /// Free chunks, ascending by address, never adjacent.
    chunks: Vec<FreeChunk>,
    seeded: bool,
}

impl ScratchAllocator {
    pub fn new() -> Self {
        ScratchAllocator { chunks: Vec::new(), seeded: false }
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// Install the scratch region as the initial single free chunk.
    pub fn seed(&mut self, addr: u32, cb: u32) {
        debug_assert!(!self.seeded);
        self.chunks = vec![FreeChunk { addr, cb }];
        self.seeded = true;
        trace!("scratch allocator seeded: {addr:#010x}+{cb:#x}");
    }

    /// Best-fit allocation; returns the PSP address of the carved block.
    pub fn alloc(&mut self, cb: u32) -> Option<u32> {
        if cb == 0 {
            return None;
        }
        let best = self
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.cb >= cb)
            .min_by_key(|(_, c)| c.cb)
            .map(|(i, _)| i)?;

        let chunk = &mut self.chunks[best];
        if chunk.cb == cb {
            let addr = chunk.addr;
            self.chunks.remove(best);
            return Some(addr);
        }
        // Shrink the chunk and hand out its high end.
        chunk.cb -= cb;
        Some(chunk.addr + chunk.cb)
    }

    /// Return a block. Adjacent free chunks merge so the list converges back
    /// to one node once everything is freed.
    pub fn free(&mut self, addr: u32, cb: u32) {
        if cb == 0 {
            return;
        }
        let pos = self.chunks.partition_point(|c| c.addr < addr);

        // Coalesce with the chunk ending exactly at `addr`.
        if pos > 0 && self.chunks[pos - 1].addr + self.chunks[pos - 1].cb == addr {
            self.chunks[pos - 1].cb += cb;
            // The grown chunk may now touch its successor.
            if pos < self.chunks.len()
                && self.chunks[pos - 1].addr + self.chunks[pos - 1].cb == self.chunks[pos].addr
            {
                self.chunks[pos - 1].cb += self.chunks[pos].cb;
                self.chunks.remove(pos);
            }
            return;
        }
        // Coalesce with the chunk starting right after the freed block.
        if pos < self.chunks.len() && addr + cb == self.chunks[pos].addr {
            self.chunks[pos].addr = addr;
            self.chunks[pos].cb += cb;
            return;
        }
        self.chunks.insert(pos, FreeChunk { addr, cb });
    }

    #[cfg(test)]
    fn free_list(&self) -> Vec<(u32, u32)> {
        self.chunks.iter().map(|c| (c.addr, c.cb)).collect()
    }
}
