//! Rank topology, halo exchange, and global reductions.
//!
//! One rank owns one rectangular subdomain and runs on its own thread;
//! there is no shared field data between ranks. Point-to-point traffic
//! (ghost rows and columns, extents, particle streams) travels over
//! dedicated channels, one per ordered rank pair, so a receive can never
//! pick up another sender's message. Collectives use a barrier plus a
//! slot table.
//!
//! The exchange discipline is the even/odd two-phase scheme: ranks whose
//! subdomain index parity is odd send first while their partners receive,
//! a barrier flips the roles, and the opposite direction runs the same way.
//! No pair of neighbors ever sends simultaneously, so the protocol cannot
//! deadlock even with rendezvous transports.

use std::sync::{Arc, Barrier, Mutex};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::grid::Grid;
use crate::{Index, MultiIndex, Real, SimError, Tag};

/// Message body on the rank transport.
pub enum Payload {
    /// One ghost row or column.
    Reals(Vec<Real>),
    /// A subdomain extent (x0, x1, y0, y1).
    Extent([Index; 4]),
    /// Flattened particle positions (x0, y0, x1, y1, ...).
    Stream(Vec<Real>),
}

struct Message {
    tag: Tag,
    payload: Payload,
}

/// State shared by all ranks of one run: the collective barrier and the
/// reduction slot table.
struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<Real>>,
}

pub struct Communicator {
    rank: usize,
    size: usize,
    /// Subdomain index of this rank within the process grid.
    tidx: MultiIndex,
    /// Process grid dimensions.
    tdim: MultiIndex,
    /// Parity of the subdomain index, used to interleave sends and
    /// receives.
    evenodd: bool,
    /// Outgoing channels, indexed by destination rank.
    senders: Vec<Sender<Message>>,
    /// Incoming channels, indexed by source rank.
    receivers: Vec<Receiver<Message>>,
    shared: Arc<Shared>,
}

impl Communicator {
    /// Builds one communicator per rank for a run with `count` ranks.
    ///
    /// Supported process counts are 1, 2 and 4, laid out as 1x1, 2x1 and
    /// 2x2 process grids.
    pub fn split(count: usize) -> Result<Vec<Communicator>, SimError> {
        let tdim = match count {
            1 => MultiIndex::new(1, 1),
            2 => MultiIndex::new(2, 1),
            4 => MultiIndex::new(2, 2),
            _ => {
                return Err(SimError::InvalidConfig(format!(
                    "unsupported process count: {} (expected 1, 2 or 4)",
                    count
                )));
            }
        };

        let shared = Arc::new(Shared {
            barrier: Barrier::new(count),
            slots: Mutex::new(vec![0.0; count]),
        });

        // Channel matrix: one directed channel per ordered pair. The
        // sender rows are indexed by destination, the receiver rows by
        // source.
        let mut senders: Vec<Vec<Sender<Message>>> = (0..count).map(|_| Vec::new()).collect();
        let mut receivers: Vec<Vec<Receiver<Message>>> = (0..count).map(|_| Vec::new()).collect();
        for from in 0..count {
            for to in 0..count {
                let (tx, rx) = unbounded();
                senders[from].push(tx);
                receivers[to].push(rx);
            }
        }

        let mut comms = Vec::with_capacity(count);
        for (rank, (tx_row, rx_row)) in senders.into_iter().zip(receivers).enumerate() {
            let tidx = MultiIndex::new(rank as Index % tdim.x, rank as Index / tdim.x);
            comms.push(Communicator {
                rank,
                size: count,
                tidx,
                tdim,
                evenodd: (tidx.x ^ tidx.y) & 1 == 1,
                senders: tx_row,
                receivers: rx_row,
                shared: Arc::clone(&shared),
            });
        }
        Ok(comms)
    }

    /// The communicator of a serial run.
    pub fn single() -> Communicator {
        // One rank always splits successfully.
        match Communicator::split(1) {
            Ok(mut v) => v.remove(0),
            Err(_) => unreachable!("a single-rank split cannot fail"),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn thread_idx(&self) -> MultiIndex {
        self.tidx
    }

    pub fn thread_dim(&self) -> MultiIndex {
        self.tdim
    }

    pub fn evenodd(&self) -> bool {
        self.evenodd
    }

    pub fn is_master(&self) -> bool {
        self.rank == 0
    }

    /// Whether this rank holds the global left edge.
    pub fn is_left(&self) -> bool {
        self.tidx.x == 0
    }

    /// Whether this rank holds the global right edge.
    pub fn is_right(&self) -> bool {
        self.tidx.x == self.tdim.x - 1
    }

    /// Whether this rank holds the global top edge.
    pub fn is_top(&self) -> bool {
        self.tidx.y == self.tdim.y - 1
    }

    /// Whether this rank holds the global bottom edge.
    pub fn is_bottom(&self) -> bool {
        self.tidx.y == 0
    }

    fn left_neighbor(&self) -> usize {
        debug_assert!(!self.is_left());
        (self.tdim.x * self.tidx.y + self.tidx.x - 1) as usize
    }

    fn right_neighbor(&self) -> usize {
        debug_assert!(!self.is_right());
        (self.tdim.x * self.tidx.y + self.tidx.x + 1) as usize
    }

    fn top_neighbor(&self) -> usize {
        debug_assert!(!self.is_top());
        (self.tdim.x * self.tidx.y + self.tidx.x + self.tdim.x) as usize
    }

    fn bottom_neighbor(&self) -> usize {
        debug_assert!(!self.is_bottom());
        (self.tdim.x * self.tidx.y + self.tidx.x - self.tdim.x) as usize
    }

    /// Blocks until every rank has arrived.
    pub fn barrier(&self) {
        if self.size > 1 {
            self.shared.barrier.wait();
        }
    }

    fn all_reduce(&self, val: Real, op: fn(Real, Real) -> Real) -> Result<Real, SimError> {
        if self.size == 1 {
            return Ok(val);
        }
        {
            let mut slots = self
                .shared
                .slots
                .lock()
                .map_err(|_| SimError::Comm("reduction table poisoned by a dead rank".into()))?;
            slots[self.rank] = val;
        }
        self.shared.barrier.wait();
        let folded = {
            let slots = self
                .shared
                .slots
                .lock()
                .map_err(|_| SimError::Comm("reduction table poisoned by a dead rank".into()))?;
            slots.iter().copied().skip(1).fold(slots[0], op)
        };
        // Keep the table stable until every rank has read it.
        self.shared.barrier.wait();
        Ok(folded)
    }

    /// Global sum over one value per rank.
    pub fn all_sum(&self, val: Real) -> Result<Real, SimError> {
        self.all_reduce(val, |a, b| a + b)
    }

    /// Global minimum over one value per rank.
    pub fn all_min(&self, val: Real) -> Result<Real, SimError> {
        self.all_reduce(val, Real::min)
    }

    /// Global maximum over one value per rank.
    pub fn all_max(&self, val: Real) -> Result<Real, SimError> {
        self.all_reduce(val, Real::max)
    }

    fn send(&self, to: usize, tag: Tag, payload: Payload) -> Result<(), SimError> {
        self.senders[to]
            .send(Message { tag, payload })
            .map_err(|_| SimError::Comm(format!("rank {} is no longer receiving", to)))
    }

    fn recv_reals(&self, from: usize) -> Result<Vec<Real>, SimError> {
        let msg = self.receivers[from]
            .recv()
            .map_err(|_| SimError::Comm(format!("rank {} is no longer sending", from)))?;
        match (msg.tag, msg.payload) {
            (Tag::Boundary, Payload::Reals(v)) => Ok(v),
            (tag, _) => Err(SimError::Comm(format!(
                "expected a boundary message from rank {}, got {:?}",
                from, tag
            ))),
        }
    }

    /// Exchanges all four ghost layers of `grid` with the neighboring
    /// subdomains. Both directions of one axis run as two parity phases
    /// separated by barriers, then the orthogonal axis follows.
    pub fn exchange_boundary(&self, grid: &mut Grid) -> Result<(), SimError> {
        if self.size == 1 {
            return Ok(());
        }
        self.copy_left_boundary(grid)?;
        self.barrier();
        self.copy_right_boundary(grid)?;
        self.barrier();
        self.copy_top_boundary(grid)?;
        self.barrier();
        self.copy_bottom_boundary(grid)?;
        Ok(())
    }

    /// Leftward traffic: the first interior column goes to the left
    /// neighbor, which writes it into its right ghost column.
    fn copy_left_boundary(&self, grid: &mut Grid) -> Result<(), SimError> {
        if self.evenodd {
            if !self.is_left() {
                self.send(
                    self.left_neighbor(),
                    Tag::Boundary,
                    Payload::Reals(grid.get_left_boundary(true)),
                )?;
            }
        } else if !self.is_right() {
            let buf = self.recv_reals(self.right_neighbor())?;
            grid.write_right_boundary(&buf);
        }

        self.barrier();

        if !self.evenodd {
            if !self.is_left() {
                self.send(
                    self.left_neighbor(),
                    Tag::Boundary,
                    Payload::Reals(grid.get_left_boundary(true)),
                )?;
            }
        } else if !self.is_right() {
            let buf = self.recv_reals(self.right_neighbor())?;
            grid.write_right_boundary(&buf);
        }
        Ok(())
    }

    /// Rightward traffic: the last interior column goes to the right
    /// neighbor, which writes it into its left ghost column.
    fn copy_right_boundary(&self, grid: &mut Grid) -> Result<(), SimError> {
        if self.evenodd {
            if !self.is_right() {
                self.send(
                    self.right_neighbor(),
                    Tag::Boundary,
                    Payload::Reals(grid.get_right_boundary(true)),
                )?;
            }
        } else if !self.is_left() {
            let buf = self.recv_reals(self.left_neighbor())?;
            grid.write_left_boundary(&buf);
        }

        self.barrier();

        if !self.evenodd {
            if !self.is_right() {
                self.send(
                    self.right_neighbor(),
                    Tag::Boundary,
                    Payload::Reals(grid.get_right_boundary(true)),
                )?;
            }
        } else if !self.is_left() {
            let buf = self.recv_reals(self.left_neighbor())?;
            grid.write_left_boundary(&buf);
        }
        Ok(())
    }

    /// Upward traffic: the last interior row goes to the top neighbor,
    /// which writes it into its bottom ghost row.
    fn copy_top_boundary(&self, grid: &mut Grid) -> Result<(), SimError> {
        if self.evenodd {
            if !self.is_top() {
                self.send(
                    self.top_neighbor(),
                    Tag::Boundary,
                    Payload::Reals(grid.get_top_boundary(true)),
                )?;
            }
        } else if !self.is_bottom() {
            let buf = self.recv_reals(self.bottom_neighbor())?;
            grid.write_bottom_boundary(&buf);
        }

        self.barrier();

        if !self.evenodd {
            if !self.is_top() {
                self.send(
                    self.top_neighbor(),
                    Tag::Boundary,
                    Payload::Reals(grid.get_top_boundary(true)),
                )?;
            }
        } else if !self.is_bottom() {
            let buf = self.recv_reals(self.bottom_neighbor())?;
            grid.write_bottom_boundary(&buf);
        }
        Ok(())
    }

    /// Downward traffic: the first interior row goes to the bottom
    /// neighbor, which writes it into its top ghost row.
    fn copy_bottom_boundary(&self, grid: &mut Grid) -> Result<(), SimError> {
        if self.evenodd {
            if !self.is_bottom() {
                self.send(
                    self.bottom_neighbor(),
                    Tag::Boundary,
                    Payload::Reals(grid.get_bottom_boundary(true)),
                )?;
            }
        } else if !self.is_top() {
            let buf = self.recv_reals(self.top_neighbor())?;
            grid.write_top_boundary(&buf);
        }

        self.barrier();

        if !self.evenodd {
            if !self.is_bottom() {
                self.send(
                    self.bottom_neighbor(),
                    Tag::Boundary,
                    Payload::Reals(grid.get_bottom_boundary(true)),
                )?;
            }
        } else if !self.is_top() {
            let buf = self.recv_reals(self.top_neighbor())?;
            grid.write_top_boundary(&buf);
        }
        Ok(())
    }

    /// Gathers every rank's extent to the master. Non-master ranks return
    /// `None` after sending theirs.
    pub fn collect_extent(
        &self,
        extent: [Index; 4],
    ) -> Result<Option<Vec<[Index; 4]>>, SimError> {
        if self.size == 1 {
            return Ok(Some(vec![extent]));
        }
        if self.is_master() {
            let mut table = vec![[0; 4]; self.size];
            table[0] = extent;
            for from in 1..self.size {
                let msg = self.receivers[from]
                    .recv()
                    .map_err(|_| SimError::Comm(format!("rank {} died before sending its extent", from)))?;
                match (msg.tag, msg.payload) {
                    (Tag::Extent, Payload::Extent(e)) => table[from] = e,
                    (tag, _) => {
                        return Err(SimError::Comm(format!(
                            "expected an extent from rank {}, got {:?}",
                            from, tag
                        )));
                    }
                }
            }
            Ok(Some(table))
        } else {
            self.send(0, Tag::Extent, Payload::Extent(extent))?;
            Ok(None)
        }
    }

    /// Gathers flattened particle positions (x, y pairs) to the master.
    /// Non-master ranks return `None` after sending theirs.
    pub fn gather_stream(&self, points: Vec<Real>) -> Result<Option<Vec<Vec<Real>>>, SimError> {
        if self.size == 1 {
            return Ok(Some(vec![points]));
        }
        if self.is_master() {
            let mut table = vec![Vec::new(); self.size];
            table[0] = points;
            for from in 1..self.size {
                let msg = self.receivers[from]
                    .recv()
                    .map_err(|_| SimError::Comm(format!("rank {} died before streaming", from)))?;
                match (msg.tag, msg.payload) {
                    (Tag::Stream, Payload::Stream(p)) => table[from] = p,
                    (tag, _) => {
                        return Err(SimError::Comm(format!(
                            "expected a particle stream from rank {}, got {:?}",
                            from, tag
                        )));
                    }
                }
            }
            Ok(Some(table))
        } else {
            self.send(0, Tag::Stream, Payload::Stream(points))?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn rejects_unsupported_process_counts() {
        for n in [0, 3, 5, 8] {
            assert!(matches!(
                Communicator::split(n),
                Err(SimError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn single_rank_holds_every_edge() {
        let comm = Communicator::single();
        assert!(comm.is_master());
        assert!(comm.is_left() && comm.is_right() && comm.is_top() && comm.is_bottom());
        assert!(!comm.evenodd());
        assert_eq!(comm.all_sum(3.5).unwrap(), 3.5);
    }

    #[test]
    fn topology_of_four_ranks() {
        let comms = Communicator::split(4).unwrap();
        let idx: Vec<MultiIndex> = comms.iter().map(|c| c.thread_idx()).collect();
        assert_eq!(idx[0], MultiIndex::new(0, 0));
        assert_eq!(idx[1], MultiIndex::new(1, 0));
        assert_eq!(idx[2], MultiIndex::new(0, 1));
        assert_eq!(idx[3], MultiIndex::new(1, 1));

        assert!(comms[0].is_left() && comms[0].is_bottom());
        assert!(comms[3].is_right() && comms[3].is_top());
        assert!(!comms[0].evenodd());
        assert!(comms[1].evenodd());
        assert!(comms[2].evenodd());
        assert!(!comms[3].evenodd());
    }

    #[test]
    fn reductions_agree_on_every_rank() {
        let comms = Communicator::split(4).unwrap();
        let results: Vec<(Real, Real, Real)> = thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let v = comm.rank() as Real;
                        (
                            comm.all_sum(v).unwrap(),
                            comm.all_min(v).unwrap(),
                            comm.all_max(v).unwrap(),
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for r in results {
            assert_eq!(r, (6.0, 0.0, 3.0));
        }
    }

    #[test]
    fn particle_streams_gather_to_the_master() {
        let comms = Communicator::split(4).unwrap();
        let results: Vec<Option<Vec<Vec<Real>>>> = thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let points = vec![comm.rank() as Real, 0.5];
                        comm.gather_stream(points).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let table = results[0].as_ref().unwrap();
        for (rank, points) in table.iter().enumerate() {
            assert_eq!(points, &vec![rank as Real, 0.5]);
        }
        assert!(results[1..].iter().all(|r| r.is_none()));
    }

    #[test]
    fn extent_gather_reaches_the_master_only() {
        let comms = Communicator::split(2).unwrap();
        let results: Vec<Option<Vec<[Index; 4]>>> = thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let r = comm.rank() as Index;
                        comm.collect_extent([r, r + 1, 0, 4]).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let table = results[0].as_ref().unwrap();
        assert_eq!(table[0], [0, 1, 0, 4]);
        assert_eq!(table[1], [1, 2, 0, 4]);
        assert!(results[1].is_none());
    }
}
