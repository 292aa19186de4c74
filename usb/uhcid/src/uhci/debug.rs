//! Human readable dumps of descriptors and of the schedule.
use std::collections::HashSet;
use std::fmt::Write;
use std::sync::atomic::Ordering;

use super::desc::*;
use super::pool::{QhHandle, TdHandle};
use super::schedule::INT_LEVELS;
use super::Uhci;

/// Upper bound on descriptors printed for one queue, in case a list is corrupt.
const LIST_LIMIT: usize = 256;

fn describe_td(bus: u32, td: &Td) -> String {
    format!("{:#010x} {:?}", bus, td)
}

fn describe_qh(bus: u32, qh: &Qh) -> String {
    format!("{:#010x} {:?}", bus, qh)
}

impl Uhci {
    fn skeleton_td_name(&self, td: TdHandle) -> Option<String> {
        let skel = &self.sched.skel;
        if let Some(level) = skel.int.iter().position(|&int| int == td) {
            return Some(format!("interrupt level {}", level));
        }
        if td == skel.end_td {
            return Some(String::from("end"));
        }
        skel.iso
            .iter()
            .position(|&iso| iso == td)
            .map(|frame| format!("frame {}", frame))
    }

    fn skeleton_qh_name(&self, qh: QhHandle) -> Option<String> {
        let skel = &self.sched.skel;
        if qh == skel.control {
            return Some(String::from("control"));
        }
        if qh == skel.end {
            return Some(String::from("end"));
        }
        skel.bulk
            .iter()
            .position(|&bulk| bulk == qh)
            .map(|chain| format!("bulk {}", chain))
    }

    /// Walk the schedule the way the controller does in a frame that visits every interrupt
    /// level, printing each descriptor and the contents of every queue it passes.
    pub fn dump_schedule(&self) -> String {
        let sched = &self.sched;
        // frames whose number ends in all ones visit the slowest level
        let frame = (1 << (INT_LEVELS - 1)) - 1;

        let mut out = String::new();
        let _ = writeln!(
            out,
            "frame list {:#010x}, path of frame {}, {} TDs and {} QHs in use",
            sched.frame_list_base(),
            frame,
            sched.tds.in_use(),
            sched.qhs.in_use()
        );

        let mut visited = HashSet::new();
        let mut link = sched.frame_entry(frame);
        while link & LINK_TERMINATE == 0 && visited.insert(link & LINK_ADDR_MASK) {
            let bus = link & LINK_ADDR_MASK;
            if link & LINK_QH != 0 {
                let Some(handle) = sched.qhs.lookup(bus) else {
                    let _ = writeln!(out, "  link to unknown QH {:#010x}", bus);
                    break;
                };
                let qh = sched.qhs.get(handle);
                match self.skeleton_qh_name(handle) {
                    Some(name) => {
                        let _ = writeln!(out, "  {} ({})", describe_qh(bus, qh), name);
                    }
                    None => {
                        let _ = writeln!(out, "  {}", describe_qh(bus, qh));
                    }
                }
                self.dump_queue(&mut out, qh);
                link = qh.head.load(Ordering::Acquire);
            } else {
                let Some(handle) = sched.tds.lookup(bus) else {
                    let _ = writeln!(out, "  link to unknown TD {:#010x}", bus);
                    break;
                };
                let td = sched.tds.get(handle);
                match self.skeleton_td_name(handle) {
                    Some(name) => {
                        let _ = writeln!(out, "  {} ({})", describe_td(bus, td), name);
                    }
                    None => {
                        let _ = writeln!(out, "    {}", describe_td(bus, td));
                    }
                }
                link = td.link.load(Ordering::Acquire);
            }
        }
        if link & LINK_TERMINATE == 0 {
            let _ = writeln!(out, "  loops back to {}", describe_link(link));
        }
        out
    }

    fn dump_queue(&self, out: &mut String, qh: &Qh) {
        let sched = &self.sched;
        let mut element = qh.element.load(Ordering::Acquire);
        for _ in 0..LIST_LIMIT {
            if element & (LINK_TERMINATE | LINK_QH) != 0 {
                return;
            }
            let bus = element & LINK_ADDR_MASK;
            let Some(handle) = sched.tds.lookup(bus) else {
                let _ = writeln!(out, "      element outside the pool: {:#010x}", bus);
                return;
            };
            let td = sched.tds.get(handle);
            let _ = writeln!(out, "      {}", describe_td(bus, td));
            element = td.link.load(Ordering::Acquire);
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::sim;
    use super::*;
    use crate::driver_interface::*;

    #[test]
    fn dump_names_skeleton_and_transfers() {
        let (uhci, _hc) = sim::controller(sim::config());
        let dump = uhci.dump_schedule();
        assert!(dump.contains("(frame 255)"));
        assert!(dump.contains("(interrupt level 8)"));
        assert!(dump.contains("(interrupt level 0)"));
        assert!(dump.contains("(control)"));
        assert!(dump.contains("(bulk 3)"));
        assert!(dump.contains("(end)"));

        let device = sim::device(&uhci, 5);
        let urb = UrbBuilder::new(&device, Pipe::bulk(1, Direction::Out, 64))
            .buffer(sim::buffer(&uhci, 128))
            .build()
            .unwrap();
        uhci.submit_urb(&urb).unwrap();
        let dump = uhci.dump_schedule();
        assert_eq!(dump.matches("OUT dev 5 ep 1").count(), 2);
    }
}
