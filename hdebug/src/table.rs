use crate::{
    DHandle, DebugSettings, Error, Generation, Guard, GuardedBuffer,
    HandleInfo, HandleQueue, HandleState, InvalidReason, Linked, Links,
    RawData, StackTrace, UHandle,
};

/// Largest number of arena slots; index + 1 must fit the low handle half.
pub const MAX_SLOTS: usize = u32::MAX as usize - 1;

/// Private metadata for one outstanding (or quarantined) handle.
pub(crate) struct DebugRecord {
    object: UHandle,
    generation: Generation,
    allocation: StackTrace,
    state: HandleState,
    borrowed: bool,
    raw_data: Option<GuardedBuffer>,
}

struct Slot {
    serial: u32,
    /// Serial space used up; the slot is never handed out again.
    retired: bool,
    record: Option<DebugRecord>,
    links: Links,
}

impl Linked for Slot {
    fn links(&self) -> &Links {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

/// Where a handle points to, as far as the table can tell.
enum Located<'a> {
    Null,
    Unknown,
    Open(u32, &'a DebugRecord),
    Quarantined(u32),
    /// Closed and already reclaimed; only the serial remembers it.
    Reclaimed,
}

/// Arena of debug records plus the open and closed queues.
///
/// Not synchronised; [`crate::Registry`] wraps it in a mutex.
pub struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    open: HandleQueue,
    closed: HandleQueue,
    guard: Guard,
    quarantine_size: usize,
    max_slots: usize,
    violations: Vec<Error>,
}

impl HandleTable {
    pub fn new(settings: &DebugSettings) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            open: HandleQueue::new(),
            closed: HandleQueue::new(),
            guard: Guard::new(settings.protection),
            quarantine_size: settings.quarantine_size,
            max_slots: MAX_SLOTS,
            violations: Vec::new(),
        }
    }

    /// Cap the identifier space, mostly to exercise exhaustion.
    pub fn with_max_slots(mut self, max_slots: usize) -> Self {
        self.max_slots = max_slots.min(MAX_SLOTS);
        self
    }

    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn quarantined_count(&self) -> usize {
        self.closed.len()
    }

    pub fn quarantine_size(&self) -> usize {
        self.quarantine_size
    }

    pub fn set_quarantine_size(&mut self, size: usize) {
        self.quarantine_size = size;
        self.evict_excess();
    }

    /// Problems found while reclaiming quarantined records.
    pub fn take_violations(&mut self) -> Vec<Error> {
        std::mem::take(&mut self.violations)
    }

    pub fn register(
        &mut self,
        object: UHandle,
        generation: Generation,
        allocation: StackTrace,
        borrowed: bool,
    ) -> Result<DHandle, Error> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= self.max_slots {
                    log::error!(
                        "debug handle identifiers exhausted ({} slots)",
                        self.slots.len()
                    );
                    return Err(Error::Allocation {
                        what: "debug handle identifiers",
                    });
                }
                self.slots.push(Slot {
                    serial: 0,
                    retired: false,
                    record: None,
                    links: Links::default(),
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.record.is_none(), "free slot {index} in use");
        slot.record = Some(DebugRecord {
            object,
            generation,
            allocation,
            state: HandleState::Open,
            borrowed,
            raw_data: None,
        });
        let handle = DHandle::new(index, slot.serial);
        self.open.push_back(&mut self.slots, index);
        Ok(handle)
    }

    fn locate(&self, handle: DHandle) -> Located<'_> {
        let Some(index) = handle.index() else {
            return Located::Null;
        };
        let Some(slot) = self.slots.get(index as usize) else {
            return Located::Unknown;
        };
        let serial = handle.serial();
        if serial < slot.serial || (slot.retired && serial == slot.serial) {
            return Located::Reclaimed;
        }
        match &slot.record {
            Some(record) if serial == slot.serial => match record.state {
                HandleState::Open => Located::Open(index, record),
                HandleState::Closed => Located::Quarantined(index),
            },
            _ => Located::Unknown,
        }
    }

    fn snapshot(&self, index: u32) -> Option<HandleInfo> {
        let slot = &self.slots[index as usize];
        let record = slot.record.as_ref()?;
        Some(HandleInfo {
            handle: DHandle::new(index, slot.serial),
            object: record.object,
            generation: record.generation,
            state: record.state,
            borrowed: record.borrowed,
            allocation: record.allocation.clone(),
            description: None,
        })
    }

    /// Snapshot of the record behind `handle`, open or quarantined.
    pub fn info(&self, handle: DHandle) -> Option<HandleInfo> {
        match self.locate(handle) {
            Located::Open(index, _) | Located::Quarantined(index) => {
                self.snapshot(index)
            }
            _ => None,
        }
    }

    fn use_after_close(&self, handle: DHandle, index: Option<u32>) -> Error {
        Error::UseAfterClose {
            handle,
            closed: index.and_then(|i| self.snapshot(i)).map(Box::new),
        }
    }

    /// The plain handle behind an open debug handle.
    pub fn resolve(&self, handle: DHandle) -> Result<UHandle, Error> {
        match self.locate(handle) {
            Located::Open(_, record) => Ok(record.object),
            Located::Quarantined(index) => {
                Err(self.use_after_close(handle, Some(index)))
            }
            Located::Reclaimed => Err(self.use_after_close(handle, None)),
            Located::Null => Err(Error::InvalidHandle {
                handle,
                reason: InvalidReason::Null,
            }),
            Located::Unknown => Err(Error::InvalidHandle {
                handle,
                reason: InvalidReason::Unknown,
            }),
        }
    }

    /// Close `handle` and move its record to quarantine. Returns the plain
    /// handle, which the caller now owns.
    ///
    /// Borrowed handles are only released by the code that lent them
    /// (`lender == true`).
    pub fn release(
        &mut self,
        handle: DHandle,
        lender: bool,
    ) -> Result<UHandle, Error> {
        let index = match self.locate(handle) {
            Located::Open(index, record) => {
                if record.borrowed && !lender {
                    return Err(Error::InvalidHandle {
                        handle,
                        reason: InvalidReason::Borrowed,
                    });
                }
                index
            }
            Located::Quarantined(..) | Located::Reclaimed => {
                return Err(Error::InvalidHandle {
                    handle,
                    reason: InvalidReason::DoubleClose,
                });
            }
            Located::Null => {
                return Err(Error::InvalidHandle {
                    handle,
                    reason: InvalidReason::Null,
                });
            }
            Located::Unknown => {
                return Err(Error::InvalidHandle {
                    handle,
                    reason: InvalidReason::Unknown,
                });
            }
        };

        self.open.remove(&mut self.slots, index);
        let slot = &mut self.slots[index as usize];
        let Some(record) = slot.record.as_mut() else {
            unreachable!("located open record vanished");
        };
        record.state = HandleState::Closed;
        if let Some(raw_data) = record.raw_data.as_mut() {
            self.guard.quarantine(raw_data);
        }
        let object = record.object;
        self.closed.push_back(&mut self.slots, index);
        self.evict_excess();
        Ok(object)
    }

    /// Copy `bytes` into guarded storage owned by the record of `handle`.
    /// The storage stays valid while the handle is open; a handle keeps the
    /// first buffer attached to it.
    pub fn attach_raw_data(
        &mut self,
        handle: DHandle,
        bytes: &[u8],
    ) -> Result<RawData, Error> {
        self.resolve(handle)?;
        let index = handle.index().ok_or(Error::InvalidHandle {
            handle,
            reason: InvalidReason::Null,
        })?;
        let Some(record) = self.slots[index as usize].record.as_mut() else {
            unreachable!("resolved record vanished");
        };
        if let Some(existing) = &record.raw_data {
            return Ok(existing.raw_data());
        }
        let buffer = self.guard.allocate(bytes)?;
        let data = buffer.raw_data();
        record.raw_data = Some(buffer);
        Ok(data)
    }

    /// Every open record with `generation >= since`, oldest first.
    pub fn open_handles(&self, since: Generation) -> Vec<HandleInfo> {
        self.open
            .iter(&self.slots)
            .filter(|(_, slot)| {
                slot.record.as_ref().is_some_and(|r| r.generation >= since)
            })
            .filter_map(|(index, _)| self.snapshot(index))
            .collect()
    }

    /// Quarantined records, oldest first.
    pub fn closed_handles(&self) -> Vec<HandleInfo> {
        self.closed
            .iter(&self.slots)
            .filter_map(|(index, _)| self.snapshot(index))
            .collect()
    }

    /// Check the poison of every quarantined record.
    pub fn verify_quarantine(&self) -> Result<(), Error> {
        for (index, slot) in self.closed.iter(&self.slots) {
            let damaged = slot
                .record
                .as_ref()
                .and_then(|r| r.raw_data.as_ref())
                .is_some_and(|buffer| !self.guard.is_intact(buffer));
            if damaged {
                let handle = DHandle::new(index, slot.serial);
                return Err(self.use_after_close(handle, Some(index)));
            }
        }
        Ok(())
    }

    fn evict_excess(&mut self) {
        while self.closed.len() > self.quarantine_size {
            let Some(index) = self.closed.front() else {
                break;
            };
            self.reclaim(index);
        }
    }

    fn reclaim(&mut self, index: u32) {
        let slot = &self.slots[index as usize];
        let handle = DHandle::new(index, slot.serial);
        let damaged = slot
            .record
            .as_ref()
            .and_then(|r| r.raw_data.as_ref())
            .is_some_and(|buffer| !self.guard.is_intact(buffer));
        if damaged {
            let err = self.use_after_close(handle, Some(index));
            log::error!("closed handle storage was written to: {err}");
            self.violations.push(err);
        }

        self.closed.remove(&mut self.slots, index);
        let slot = &mut self.slots[index as usize];
        slot.record = None;
        if slot.serial == u32::MAX {
            log::debug!("retiring slot {index}, serial space exhausted");
            slot.retired = true;
            return;
        }
        slot.serial += 1;
        self.free.push(index);
    }
}
