//! Paged bump arena.
//!
//! Reservations are handed out from fixed-size pages. A full page is never
//! grown or copied; the arena simply starts a new one, so a [`Reservation`]
//! keeps naming the same bytes for the arena's whole lifetime. Requests
//! larger than the page size get a dedicated page of exactly that size.
//!
//! [`PagedAllocation::global_offset`] is the byte offset the next reservation
//! would have if every reservation so far were laid end to end.

/// Default page size of the arena.
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Handle to reserved bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Reservation {
    page: u32,
    offset: u32,
    len: u32,
    global_offset: u64,
}

impl Reservation {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Position of this reservation in reservation order, in bytes.
    #[must_use]
    pub const fn global_offset(&self) -> u64 {
        self.global_offset
    }
}

struct Page {
    buffer: Box<[u8]>,
    free_offset: usize,
}

impl Page {
    fn new(size: usize) -> Self {
        Self {
            buffer: vec![0; size].into_boxed_slice(),
            free_offset: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.buffer.len() - self.free_offset
    }
}

/// Write-once arena of zero-initialized reservations.
pub struct PagedAllocation {
    pages: Vec<Page>,
    page_size: usize,
    /// Index of the page new small reservations are carved from.
    current: Option<usize>,
    reservations: Vec<Reservation>,
    global_offset: u64,
}

impl Default for PagedAllocation {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl PagedAllocation {
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            pages: Vec::new(),
            page_size: page_size.max(1),
            current: None,
            reservations: Vec::new(),
            global_offset: 0,
        }
    }

    /// Reserve `size` zeroed bytes.
    pub fn reserve(&mut self, size: usize) -> Reservation {
        let page = if size > self.page_size {
            self.pages.push(Page::new(size));
            self.pages.len() - 1
        } else {
            match self.current {
                Some(index) if self.pages[index].remaining() >= size => index,
                _ => {
                    self.pages.push(Page::new(self.page_size));
                    let index = self.pages.len() - 1;
                    self.current = Some(index);
                    index
                }
            }
        };

        let offset = self.pages[page].free_offset;
        self.pages[page].free_offset += size;
        let reservation = Reservation {
            page: page as u32,
            offset: offset as u32,
            len: size as u32,
            global_offset: self.global_offset,
        };
        self.global_offset += size as u64;
        self.reservations.push(reservation);
        reservation
    }

    #[must_use]
    pub fn get(&self, reservation: Reservation) -> &[u8] {
        let start = reservation.offset as usize;
        &self.pages[reservation.page as usize].buffer[start..start + reservation.len()]
    }

    pub fn get_mut(&mut self, reservation: Reservation) -> &mut [u8] {
        let start = reservation.offset as usize;
        &mut self.pages[reservation.page as usize].buffer[start..start + reservation.len()]
    }

    /// Total bytes reserved so far.
    #[must_use]
    pub const fn global_offset(&self) -> u64 {
        self.global_offset
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Reservations in the order they were made.
    #[must_use]
    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    /// Bytes of every reservation, in reservation order.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.reservations.iter().map(|&r| self.get(r))
    }
}
