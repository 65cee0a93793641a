//! Tool-head coordinates for the tip rack and reagent reservoir.
//!
//! Pure state, no I/O. Tip pickups are counted separately from cycles because
//! each cycle consumes two tips (dispense and aspiration) but draws from the
//! reservoir once.

use serde::{Deserialize, Serialize};

use crate::config::RackGeometry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleState {
    pub tip_x: f64,
    pub tip_y: f64,
    pub reservoir_x: f64,
    pub reservoir_y: f64,
    /// Completed dispense/aspirate cycles, starting at 1.
    pub sequence_counter: u32,
    /// Tip pickups taken so far, starting at 1.
    // Row breaks key on this, not on `sequence_counter`: a cycle takes two tips.
    pub tip_counter: u32,
}

impl CycleState {
    pub fn new(geometry: &RackGeometry) -> Self {
        Self {
            tip_x: geometry.tip_origin.x,
            tip_y: geometry.tip_origin.y,
            reservoir_x: geometry.reservoir_origin.x,
            reservoir_y: geometry.reservoir_origin.y,
            sequence_counter: 1,
            tip_counter: 1,
        }
    }

    pub fn tip_pickup_coordinates(&self) -> (f64, f64) {
        (self.tip_x, self.tip_y)
    }

    pub fn reservoir_coordinates(&self) -> (f64, f64) {
        (self.reservoir_x, self.reservoir_y)
    }

    /// Step to the next tip position. At a row break x returns to the row
    /// start and y moves one pitch; otherwise x moves one pitch.
    pub fn advance_tip(&mut self, geometry: &RackGeometry) {
        if geometry.tip_row_breaks.contains(&self.tip_counter) {
            self.tip_x = geometry.tip_origin.x;
            self.tip_y += geometry.tip_pitch;
        } else {
            self.tip_x += geometry.tip_pitch;
        }
        self.tip_counter += 1;
    }

    /// Step to the next reagent well. Wells run down a column in -y; at a
    /// column break x moves one column and y returns to the column start.
    pub fn advance_reservoir(&mut self, geometry: &RackGeometry) {
        if geometry.reservoir_column_breaks.contains(&self.sequence_counter) {
            self.reservoir_x += geometry.reservoir_column_pitch;
            self.reservoir_y = geometry.reservoir_origin.y;
        } else {
            self.reservoir_y -= geometry.reservoir_well_pitch;
        }
    }

    /// Must run once per completed cycle, after that cycle's coordinates were used.
    pub fn advance_cycle(&mut self) {
        self.sequence_counter += 1;
    }
}
