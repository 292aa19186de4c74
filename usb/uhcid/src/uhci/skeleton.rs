//! The permanent schedule skeleton and the primitives that splice transfers into it.
//!
//! Layout, as the controller walks it in frame `f`:
//!
//! ```text
//! frame_list[f] -> iso[f] -> (iso TDs of frame f) -> int[L(f)] -> ... -> int[0]
//!   -> control QH -> (control QHs) -> bulk[0] -> ... -> bulk[3] -> (bulk QHs) -> end QH
//! ```
//!
//! `int[k]` is visited every `2^k` frames. Transfer TDs hang off `iso[f]` and `int[k]`, queue
//! heads are placed between the skeleton QHs.
//!
//! Every link change writes the new descriptor's own link first and only then publishes it
//! through its predecessor, so the controller never follows a link into a half-built chain.
//! Removing a descriptor only redirects its predecessor; its own link keeps pointing forward so a
//! controller that is already looking at it can still continue.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use common::dma::{BusMapper, Dma};
use log::{trace, warn};
use smallvec::SmallVec;
use syscall::error::{Error, Result, EINVAL};

use super::desc::{publish, Qh, Td, LINK_DEPTH, LINK_QH, LINK_TERMINATE};
use super::pool::{DescPool, QhHandle, TdHandle};
use super::schedule::{frame_level, FRAME_COUNT, INT_LEVELS};
use crate::config::UhciConfig;

pub const BULK_CHAINS: usize = 4;

/// Where a horizontally linked TD is attached.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Anchor {
    /// Isochronous TDs of one frame.
    Frame(u16),
    /// Interrupt TDs of one polling level.
    Interrupt(u8),
}

impl Anchor {
    fn index(self) -> usize {
        match self {
            Self::Frame(frame) => frame as usize % FRAME_COUNT,
            Self::Interrupt(level) => FRAME_COUNT + level as usize,
        }
    }
}

/// Handles of the skeleton descriptors. Allocated once, never freed while the controller lives.
pub struct Skeleton {
    pub iso: Vec<TdHandle>,
    pub int: [TdHandle; INT_LEVELS],
    pub control: QhHandle,
    pub bulk: [QhHandle; BULK_CHAINS],
    pub end: QhHandle,
    pub end_td: TdHandle,
}

/// Software view of the horizontal TD chains: the TDs inserted after every anchor, in hardware
/// order.
struct TdChains {
    chains: Vec<SmallVec<[TdHandle; 2]>>,
}

/// Software view of the asynchronous QH chain, skeleton QHs included.
struct QhChain {
    order: Vec<QhHandle>,
    reclamation_users: usize,
}

pub struct Schedule {
    pub tds: DescPool<Td>,
    pub qhs: DescPool<Qh>,
    frame_list: Dma<[AtomicU32]>,
    frame_list_base: u32,
    pub skel: Skeleton,
    td_chains: Mutex<TdChains>,
    qh_chain: Mutex<QhChain>,
    reclamation: bool,
}

impl Schedule {
    pub fn new(config: &UhciConfig, mapper: &Arc<dyn BusMapper>) -> Result<Self> {
        let tds = DescPool::<Td>::new(
            FRAME_COUNT + INT_LEVELS + 1 + config.pool.transfer_descriptors,
            mapper,
        )?;
        let qhs = DescPool::<Qh>::new(BULK_CHAINS + 2 + config.pool.queue_heads, mapper)?;
        let frame_list = unsafe { Dma::<[AtomicU32]>::zeroed_unsized(FRAME_COUNT, mapper)? };
        let frame_list_base = u32::try_from(frame_list.physical()).map_err(|_| {
            warn!("frame list at {:#x} is above 4 GiB", frame_list.physical());
            Error::new(EINVAL)
        })?;

        let skel = Skeleton {
            iso: (0..FRAME_COUNT)
                .map(|_| tds.alloc())
                .collect::<Result<Vec<_>>>()?,
            int: {
                let mut int = [tds.alloc()?; INT_LEVELS];
                for slot in int.iter_mut().skip(1) {
                    *slot = tds.alloc()?;
                }
                int
            },
            control: qhs.alloc()?,
            bulk: [qhs.alloc()?, qhs.alloc()?, qhs.alloc()?, qhs.alloc()?],
            end: qhs.alloc()?,
            end_td: tds.alloc()?,
        };

        // Terminating TD below the end QH, some PIIX controllers misbehave on an empty QH at the
        // end of the schedule.
        qhs.get(skel.end)
            .element
            .store(tds.bus(skel.end_td), Ordering::Relaxed);
        qhs.get(skel.bulk[BULK_CHAINS - 1])
            .head
            .store(qhs.bus(skel.end) | LINK_QH, Ordering::Relaxed);
        for pair in skel.bulk.windows(2) {
            qhs.get(pair[0])
                .head
                .store(qhs.bus(pair[1]) | LINK_QH, Ordering::Relaxed);
        }
        qhs.get(skel.control)
            .head
            .store(qhs.bus(skel.bulk[0]) | LINK_QH, Ordering::Relaxed);

        tds.get(skel.int[0])
            .link
            .store(qhs.bus(skel.control) | LINK_QH, Ordering::Relaxed);
        for level in 1..INT_LEVELS {
            tds.get(skel.int[level])
                .link
                .store(tds.bus(skel.int[level - 1]), Ordering::Relaxed);
        }

        for (frame, &iso) in skel.iso.iter().enumerate() {
            let level = frame_level(frame);
            tds.get(iso)
                .link
                .store(tds.bus(skel.int[level as usize]), Ordering::Relaxed);
            frame_list[frame].store(tds.bus(iso), Ordering::Relaxed);
        }

        let mut order = Vec::with_capacity(BULK_CHAINS + 2);
        order.push(skel.control);
        order.extend_from_slice(&skel.bulk);
        order.push(skel.end);

        trace!(
            "skeleton: frame list {:#010x}, {:?}, {:?}",
            frame_list_base,
            tds,
            qhs
        );

        Ok(Self {
            tds,
            qhs,
            frame_list,
            frame_list_base,
            skel,
            td_chains: Mutex::new(TdChains {
                chains: vec![SmallVec::new(); FRAME_COUNT + INT_LEVELS],
            }),
            qh_chain: Mutex::new(QhChain {
                order,
                reclamation_users: 0,
            }),
            reclamation: config.schedule.bandwidth_reclamation,
        })
    }

    pub fn frame_list_base(&self) -> u32 {
        self.frame_list_base
    }

    pub fn frame_entry(&self, frame: usize) -> u32 {
        self.frame_list[frame % FRAME_COUNT].load(Ordering::Acquire)
    }

    fn anchor_td(&self, anchor: Anchor) -> TdHandle {
        match anchor {
            Anchor::Frame(frame) => self.skel.iso[frame as usize % FRAME_COUNT],
            Anchor::Interrupt(level) => self.skel.int[level as usize],
        }
    }

    /// Insert a filled-in TD right after an anchor.
    pub fn insert_td(&self, anchor: Anchor, td: TdHandle) {
        let mut chains = self.td_chains.lock().unwrap();
        let anchor_td = self.tds.get(self.anchor_td(anchor));
        self.tds
            .get(td)
            .link
            .store(anchor_td.link.load(Ordering::Acquire), Ordering::Release);
        publish(&anchor_td.link, self.tds.bus(td));
        chains.chains[anchor.index()].insert(0, td);
    }

    /// Make a TD unreachable. It may still be read by the controller until the end of the
    /// current frame.
    pub fn unlink_td(&self, anchor: Anchor, td: TdHandle) -> bool {
        let mut chains = self.td_chains.lock().unwrap();
        let chain = &mut chains.chains[anchor.index()];
        let Some(pos) = chain.iter().position(|&other| other == td) else {
            warn!("{:?} is not linked at {:?}", td, anchor);
            return false;
        };
        let prev = if pos == 0 {
            self.anchor_td(anchor)
        } else {
            chain[pos - 1]
        };
        publish(
            &self.tds.get(prev).link,
            self.tds.get(td).link.load(Ordering::Acquire),
        );
        chain.remove(pos);
        true
    }

    /// Number of transfer TDs attached to an anchor.
    pub fn anchored(&self, anchor: Anchor) -> usize {
        self.td_chains.lock().unwrap().chains[anchor.index()].len()
    }

    /// Append a filled-in TD to the vertical list of a QH. `list` is the queue's software list.
    pub fn append_td(&self, qh: QhHandle, list: &mut SmallVec<[TdHandle; 8]>, td: TdHandle, depth_first: bool) {
        let _chains = self.td_chains.lock().unwrap();
        self.tds.get(td).link.store(LINK_TERMINATE, Ordering::Release);
        match list.last() {
            Some(&tail) => {
                let flags = if depth_first { LINK_DEPTH } else { 0 };
                publish(&self.tds.get(tail).link, self.tds.bus(td) | flags)
            }
            None => publish(&self.qhs.get(qh).element, self.tds.bus(td)),
        }
        list.push(td);
    }

    /// Point a QH at `td` again, e.g. to resume a queue after a short packet.
    pub fn retrigger(&self, qh: QhHandle, td: TdHandle) {
        let _chains = self.td_chains.lock().unwrap();
        publish(&self.qhs.get(qh).element, self.tds.bus(td));
    }

    /// Link a QH into the asynchronous chain right before the skeleton QH `before`.
    pub fn insert_qh(&self, before: QhHandle, qh: QhHandle) -> Result<()> {
        let mut chain = self.qh_chain.lock().unwrap();
        let pos = chain
            .order
            .iter()
            .position(|&other| other == before)
            .filter(|&pos| pos > 0)
            .ok_or(Error::new(EINVAL))?;
        let prev = chain.order[pos - 1];
        self.qhs
            .get(qh)
            .head
            .store(self.qhs.bus(before) | LINK_QH, Ordering::Release);
        publish(&self.qhs.get(prev).head, self.qhs.bus(qh) | LINK_QH);
        chain.order.insert(pos, qh);
        Ok(())
    }

    pub fn unlink_qh(&self, qh: QhHandle) -> bool {
        let mut chain = self.qh_chain.lock().unwrap();
        let Some(pos) = chain.order.iter().position(|&other| other == qh).filter(|&pos| pos > 0) else {
            warn!("{:?} is not in the async chain", qh);
            return false;
        };
        let prev = chain.order[pos - 1];
        publish(
            &self.qhs.get(prev).head,
            self.qhs.get(qh).head.load(Ordering::Acquire),
        );
        chain.order.remove(pos);
        true
    }

    /// The skeleton QH a new queue of the given kind is inserted in front of.
    pub fn control_tail(&self) -> QhHandle {
        self.skel.bulk[0]
    }
    pub fn bulk_tail(&self, endpoint: u8) -> QhHandle {
        let chain = endpoint as usize % BULK_CHAINS;
        if chain + 1 < BULK_CHAINS {
            self.skel.bulk[chain + 1]
        } else {
            self.skel.end
        }
    }

    /// Transfer QHs currently linked into the async chain, in hardware order.
    pub fn async_queues(&self) -> Vec<QhHandle> {
        let skel = &self.skel;
        self.qh_chain
            .lock()
            .unwrap()
            .order
            .iter()
            .copied()
            .filter(|&qh| qh != skel.control && qh != skel.end && !skel.bulk.contains(&qh))
            .collect()
    }

    /// A full-speed control or bulk queue was added. While any exist, the end of the schedule
    /// loops back to the control chain so idle frame time is spent on them.
    pub fn reclamation_get(&self) {
        let mut chain = self.qh_chain.lock().unwrap();
        chain.reclamation_users += 1;
        if self.reclamation && chain.reclamation_users == 1 {
            trace!("bandwidth reclamation on");
            publish(
                &self.qhs.get(self.skel.end).head,
                self.qhs.bus(self.skel.control) | LINK_QH,
            );
        }
    }

    pub fn reclamation_put(&self) {
        let mut chain = self.qh_chain.lock().unwrap();
        chain.reclamation_users = chain.reclamation_users.saturating_sub(1);
        if self.reclamation && chain.reclamation_users == 0 {
            trace!("bandwidth reclamation off");
            publish(&self.qhs.get(self.skel.end).head, LINK_TERMINATE);
        }
    }

    pub fn reclaiming(&self) -> bool {
        self.qhs.get(self.skel.end).head.load(Ordering::Acquire) & LINK_TERMINATE == 0
    }
}
