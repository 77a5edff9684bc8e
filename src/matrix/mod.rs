//! Virtual Matrix Layer
//!
//! Responsibilities:
//! - Concatenate both routers' visible ports into one index space
//! - Hide tie-line ports from the combined view
//! - Resolve virtual indices to (router, physical port) and back
//! - NO IO operations
//! - NO async operations
//!
//! The projection is a pure function of the two router states, the
//! tie-line configuration, and the tie-line runtime state. It is rebuilt
//! by the orchestrator on every change and never mutated in place.

use std::collections::HashMap;

use crate::common::{LockState, RouterId, RouterState};
use crate::config::TieLineConfig;
use crate::engine::TieLineState;

/// The combined virtual router view.
///
/// Instances are snapshots: build one with [`VirtualMatrix::project`] and
/// replace it wholesale when anything underneath changes.
#[derive(Debug, Clone, Default)]
pub struct VirtualMatrix {
    /// Total visible inputs (A's then B's)
    pub inputs: u16,
    /// Total visible outputs (A's then B's)
    pub outputs: u16,
    /// Virtual routing: virtual output -> virtual input. Sparse.
    routing: HashMap<u16, u16>,
    input_labels: Vec<String>,
    output_labels: Vec<String>,
    locks: Vec<LockState>,
    /// Virtual input -> owning router and physical port
    input_map: Vec<(RouterId, u16)>,
    /// Virtual output -> owning router and physical port
    output_map: Vec<(RouterId, u16)>,
    input_rev: HashMap<(RouterId, u16), u16>,
    output_rev: HashMap<(RouterId, u16), u16>,
}

impl VirtualMatrix {
    /// Build the combined view.
    ///
    /// Tie-line ports are excluded from the index space; an output routed
    /// to a tie-line sink reports the far router's source instead.
    pub fn project(
        state_a: &RouterState,
        state_b: &RouterState,
        config: &TieLineConfig,
        ties: &TieLineState,
    ) -> Self {
        // Exclusion sets: the four groups of ports consumed by cabling.
        let excluded_out_a: Vec<u16> = config.a_to_b.iter().map(|t| t.output).collect();
        let excluded_out_b: Vec<u16> = config.b_to_a.iter().map(|t| t.output).collect();
        let excluded_in_a: Vec<u16> = config.b_to_a.iter().map(|t| t.input).collect();
        let excluded_in_b: Vec<u16> = config.a_to_b.iter().map(|t| t.input).collect();

        let visible = |count: u16, excluded: &[u16]| -> Vec<u16> {
            (0..count).filter(|p| !excluded.contains(p)).collect()
        };

        let in_a = visible(state_a.inputs, &excluded_in_a);
        let in_b = visible(state_b.inputs, &excluded_in_b);
        let out_a = visible(state_a.outputs, &excluded_out_a);
        let out_b = visible(state_b.outputs, &excluded_out_b);

        let mut matrix = VirtualMatrix::default();

        for (router, state, ports) in [
            (RouterId::A, state_a, &in_a),
            (RouterId::B, state_b, &in_b),
        ] {
            for &port in ports {
                let virtual_index = matrix.input_map.len() as u16;
                matrix.input_map.push((router, port));
                matrix.input_rev.insert((router, port), virtual_index);
                matrix.input_labels.push(state.input_label(port));
            }
        }

        for (router, state, ports) in [
            (RouterId::A, state_a, &out_a),
            (RouterId::B, state_b, &out_b),
        ] {
            for &port in ports {
                let virtual_index = matrix.output_map.len() as u16;
                matrix.output_map.push((router, port));
                matrix.output_rev.insert((router, port), virtual_index);
                matrix.output_labels.push(state.output_label(port));
                matrix.locks.push(state.lock(port));
            }
        }

        matrix.inputs = matrix.input_map.len() as u16;
        matrix.outputs = matrix.output_map.len() as u16;

        // Virtual routing, resolving tie-line hops through the runtime
        // records.
        for v_out in 0..matrix.outputs {
            let (router, port) = matrix.output_map[v_out as usize];
            let state = match router {
                RouterId::A => state_a,
                RouterId::B => state_b,
            };
            let Some(q) = state.route(port) else {
                continue;
            };

            let sink_pool = match router {
                // A outputs fed from a B->A sink, B outputs from an A->B sink
                RouterId::A => (&config.b_to_a, &ties.b_to_a),
                RouterId::B => (&config.a_to_b, &ties.a_to_b),
            };

            let tie_index = sink_pool.0.iter().position(|t| t.input == q);
            let v_in = match tie_index {
                Some(index) => {
                    // Routed into a tie-line sink: report the source the
                    // cable carries on the far router, if any.
                    sink_pool
                        .1
                        .get(index)
                        .and_then(|tl| tl.source_input)
                        .and_then(|source| matrix.input_rev.get(&(router.other(), source)))
                        .copied()
                }
                None => matrix.input_rev.get(&(router, q)).copied(),
            };

            if let Some(v_in) = v_in {
                matrix.routing.insert(v_out, v_in);
            }
        }

        matrix
    }

    /// Resolve a virtual input to its owning router and physical port.
    pub fn resolve_input(&self, v: u16) -> Option<(RouterId, u16)> {
        self.input_map.get(v as usize).copied()
    }

    /// Resolve a virtual output to its owning router and physical port.
    pub fn resolve_output(&self, v: u16) -> Option<(RouterId, u16)> {
        self.output_map.get(v as usize).copied()
    }

    /// Invert: physical input to virtual index, if visible.
    pub fn input_to_virtual(&self, router: RouterId, port: u16) -> Option<u16> {
        self.input_rev.get(&(router, port)).copied()
    }

    /// Invert: physical output to virtual index, if visible.
    pub fn output_to_virtual(&self, router: RouterId, port: u16) -> Option<u16> {
        self.output_rev.get(&(router, port)).copied()
    }

    /// Virtual input currently feeding a virtual output, if known.
    pub fn route(&self, v_out: u16) -> Option<u16> {
        self.routing.get(&v_out).copied()
    }

    pub fn routing(&self) -> &HashMap<u16, u16> {
        &self.routing
    }

    pub fn input_label(&self, v: u16) -> Option<&str> {
        self.input_labels.get(v as usize).map(|s| s.as_str())
    }

    pub fn output_label(&self, v: u16) -> Option<&str> {
        self.output_labels.get(v as usize).map(|s| s.as_str())
    }

    /// Physical-router lock state for a virtual output.
    pub fn lock(&self, v_out: u16) -> LockState {
        self.locks.get(v_out as usize).copied().unwrap_or_default()
    }
}
