//! Avalanching of slopes steeper than the angle of repose.

use crate::flow::Layer;
use crate::Terrain;
use log::warn;
use std::collections::VecDeque;

impl Terrain {
    /// Lets sediment slide away from `(i, j)` until every cell reached is
    /// below the sediment repose angle.
    ///
    /// Each unstable cell gives up one transport quantum, split among its
    /// downhill neighbours by flow share, and those neighbours are queued in
    /// turn. A cell without sediment ends its branch. Whatever the source
    /// actually held is what its receivers get, so no mass is created.
    pub fn stabilize_sediment(&self, i: usize, j: usize) {
        let quantum = self.settings.transport_quantum;
        let tan = self.settings.tan_repose_sediment;
        let mut queue = VecDeque::from([(i, j)]);
        let mut pops = 0;

        while let Some((ci, cj)) = queue.pop_front() {
            pops += 1;
            if pops > self.settings.stabilization_cap {
                warn!(
                    "sediment stabilization from ({i}, {j}) stopped after {} cells, {} still queued",
                    self.settings.stabilization_cap,
                    queue.len() + 1
                );
                return;
            }

            let index = self.lattice.index(ci, cj);
            if self.sediments.get_index(index) <= 0.0 {
                continue;
            }
            let flows = self.compute_flow(Layer::Sediment, ci, cj, tan);
            if flows.is_empty() {
                continue;
            }

            let moved = self.sediments.take(index, quantum);
            for flow in flows.iter() {
                self.sediments
                    .add(self.lattice.index(flow.i, flow.j), moved * flow.share);
                queue.push_back((flow.i, flow.j));
            }
        }
    }

    /// Lets bedrock slide away from `(i, j)` at the bedrock repose angle.
    ///
    /// Unlike sediment, bedrock never runs out: an unstable cell is
    /// re-examined until it holds, and its receivers are queued behind it.
    /// Returns `true` when this call moved nothing.
    pub fn stabilize_bedrock(&self, i: usize, j: usize) -> bool {
        let quantum = self.settings.transport_quantum;
        let tan = self.settings.tan_repose_bedrock;
        let mut queue = VecDeque::from([(i, j)]);
        let mut stable = true;
        let mut pops = 0;

        while let Some(&(ci, cj)) = queue.front() {
            pops += 1;
            if pops > self.settings.stabilization_cap {
                warn!(
                    "bedrock stabilization from ({i}, {j}) stopped after {} iterations",
                    self.settings.stabilization_cap
                );
                break;
            }

            let flows = self.compute_flow(Layer::Bedrock, ci, cj, tan);
            if flows.is_empty() {
                queue.pop_front();
                continue;
            }
            stable = false;

            for flow in flows.iter() {
                self.bedrock
                    .add(self.lattice.index(flow.i, flow.j), quantum * flow.share);
                queue.push_back((flow.i, flow.j));
            }
            self.bedrock.sub(self.lattice.index(ci, cj), quantum);
        }
        stable
    }

    /// Stabilizes the bedrock of every cell, lowest first.
    ///
    /// The order comes from one sort of the current bedrock. Returns `true`
    /// when no cell moved.
    pub fn stabilize_bedrock_all(&self) -> bool {
        let elevation = self.bedrock.snapshot();
        let mut order = (0..self.lattice.len()).collect::<Vec<_>>();
        order.sort_by(|&a, &b| elevation[a].total_cmp(&elevation[b]));

        order.into_iter().fold(true, |stable, index| {
            let (i, j) = self.lattice.index_2d(index);
            self.stabilize_bedrock(i, j) && stable
        })
    }
}
