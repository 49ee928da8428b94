use super::RemSetEngine;

/// A snapshot of the engine's counters, for cumulative and periodic
/// reporting. Periodic reporting keeps the previous period's snapshot and
/// prints the delta.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct RemSetSummary {
    pub num_conc_refined_cards: usize,
    pub num_processed_buffers: usize,
    pub total_cards_scanned: usize,
    pub num_hot_cache_inserts: usize,
    pub num_hot_cache_evictions: usize,
    pub total_rs_occupied: usize,
    pub total_rs_mem_size: usize,
}

impl RemSetSummary {
    /// Populates this summary from the engine's current counters.
    pub fn initialize(&mut self, engine: &RemSetEngine) {
        let mut total_rs_occupied = 0;
        let mut total_rs_mem_size = 0;
        let heap = engine.heap();
        for i in 0..heap.region_count() {
            let rs = heap.region(i).rem_set();
            total_rs_occupied += rs.occupied();
            total_rs_mem_size += rs.mem_size();
        }
        *self = RemSetSummary {
            num_conc_refined_cards: engine.conc_refined_cards(),
            num_processed_buffers: engine.dcqs().processed_buffers_num(),
            total_cards_scanned: engine.total_cards_scanned(),
            num_hot_cache_inserts: engine.hot_card_cache().cache_inserts(),
            num_hot_cache_evictions: engine.hot_card_cache().cache_evictions(),
            total_rs_occupied,
            total_rs_mem_size,
        };
    }

    /// Replaces this summary with `other - self`, element-wise. Gauge-like
    /// values (RS occupancy and footprint) can shrink between periods, so
    /// the subtraction saturates.
    pub fn subtract_from(&mut self, other: &RemSetSummary) {
        self.num_conc_refined_cards = other
            .num_conc_refined_cards
            .saturating_sub(self.num_conc_refined_cards);
        self.num_processed_buffers = other
            .num_processed_buffers
            .saturating_sub(self.num_processed_buffers);
        self.total_cards_scanned = other
            .total_cards_scanned
            .saturating_sub(self.total_cards_scanned);
        self.num_hot_cache_inserts = other
            .num_hot_cache_inserts
            .saturating_sub(self.num_hot_cache_inserts);
        self.num_hot_cache_evictions = other
            .num_hot_cache_evictions
            .saturating_sub(self.num_hot_cache_evictions);
        self.total_rs_occupied = other.total_rs_occupied.saturating_sub(self.total_rs_occupied);
        self.total_rs_mem_size = other.total_rs_mem_size.saturating_sub(self.total_rs_mem_size);
    }

    pub fn set(&mut self, other: &RemSetSummary) {
        *self = other.clone();
    }

    pub fn print_on(&self, header: &str) {
        info!("{}", header);
        info!(
            " concurrently refined cards: {}, processed buffers: {}",
            self.num_conc_refined_cards, self.num_processed_buffers
        );
        info!(" cards scanned during pauses: {}", self.total_cards_scanned);
        info!(
            " hot card cache: {} inserts, {} evictions",
            self.num_hot_cache_inserts, self.num_hot_cache_evictions
        );
        info!(
            " remembered sets: {} cards, {} bytes",
            self.total_rs_occupied, self.total_rs_mem_size
        );
    }
}
