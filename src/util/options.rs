use std::str::FromStr;

use crate::util::constants::*;
use crate::policy::region::card::BYTES_IN_CARD;

/// Tunables of the remembered-set engine. All fields are read-only to the
/// engine once it is booted.
///
/// Every option can be overridden from the environment with a `REMSET_`
/// prefixed, upper-snake-case variable (e.g. `REMSET_SCAN_BLOCK_SIZE=32`).
/// Invalid values are rejected with a warning and the previous value kept.
#[derive(Clone, Debug)]
pub struct Options {
    /// Heap size in bytes; must be a non-zero multiple of the region size.
    pub heap_size: usize,
    /// Number of cards each worker claims at once when scanning a
    /// collection-set region's remembered set. Minimum 1.
    pub scan_block_size: usize,
    /// Chunk size in bytes for remembered-set rebuilding; a power of two,
    /// at least one card.
    pub rebuild_chunk_size: usize,
    /// Print a remembered-set summary on request.
    pub summarize_rset_stats: bool,
    /// Flush and apply all dirty-card logs before heap verification.
    pub flush_log_buffers_on_verify: bool,
    /// Keep verifying remembered sets during full collections.
    pub verify_rsets_during_full_gc: bool,
    /// Log per-chunk progress of remembered-set rebuilding.
    pub trace_rebuild_rem_set: bool,
    /// Number of parallel GC workers for the pause-time phases.
    pub parallel_gc_threads: usize,
    /// Number of concurrent refinement worker threads.
    pub refinement_threads: usize,
    /// Capacity of the hot card cache in cards; 0 disables the cache.
    pub hot_card_cache_size: usize,
    /// A card is considered hot once it has been dirtied this many times.
    pub hot_card_threshold: u8,
    /// Cards per dirty-card queue buffer.
    pub dcq_buffer_size: usize,
    /// Completed buffers outstanding before refinement is triggered.
    pub refinement_trigger_buffers: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            heap_size: 64 * BYTES_IN_MBYTE,
            scan_block_size: 64,
            rebuild_chunk_size: 256 * 1024,
            summarize_rset_stats: false,
            flush_log_buffers_on_verify: false,
            verify_rsets_during_full_gc: false,
            trace_rebuild_rem_set: false,
            parallel_gc_threads: num_cpus::get(),
            refinement_threads: 2,
            hot_card_cache_size: 1024,
            hot_card_threshold: 4,
            dcq_buffer_size: 256,
            refinement_trigger_buffers: 5,
        }
    }
}

fn parse_into<T: FromStr + Copy>(slot: &mut T, value: &str, valid: fn(T) -> bool) -> bool {
    match value.parse::<T>() {
        Ok(v) if valid(v) => {
            *slot = v;
            true
        }
        _ => false,
    }
}

impl Options {
    /// Default options with environment overrides applied.
    pub fn from_env() -> Self {
        let mut options = Options::default();
        for key in KEYS {
            let var = format!("REMSET_{}", key.to_uppercase());
            if let Ok(value) = std::env::var(&var) {
                if !options.process(key, &value) {
                    warn!("ignoring invalid value {:?} for {}", value, var);
                }
            }
        }
        options
    }

    /// Sets a single option from its string form. Returns false and leaves
    /// the option unchanged if the name is unknown or the value is invalid.
    pub fn process(&mut self, name: &str, value: &str) -> bool {
        match name {
            "heap_size" => parse_into(&mut self.heap_size, value, |v: usize| {
                v > 0 && v % (BYTES_IN_MBYTE) == 0
            }),
            "scan_block_size" => parse_into(&mut self.scan_block_size, value, |v: usize| v >= 1),
            "rebuild_chunk_size" => parse_into(&mut self.rebuild_chunk_size, value, |v: usize| {
                v.is_power_of_two() && v >= BYTES_IN_CARD
            }),
            "summarize_rset_stats" => {
                parse_into(&mut self.summarize_rset_stats, value, |_: bool| true)
            }
            "flush_log_buffers_on_verify" => {
                parse_into(&mut self.flush_log_buffers_on_verify, value, |_: bool| true)
            }
            "verify_rsets_during_full_gc" => {
                parse_into(&mut self.verify_rsets_during_full_gc, value, |_: bool| true)
            }
            "trace_rebuild_rem_set" => {
                parse_into(&mut self.trace_rebuild_rem_set, value, |_: bool| true)
            }
            "parallel_gc_threads" => {
                parse_into(&mut self.parallel_gc_threads, value, |v: usize| v >= 1)
            }
            "refinement_threads" => {
                parse_into(&mut self.refinement_threads, value, |_: usize| true)
            }
            "hot_card_cache_size" => {
                parse_into(&mut self.hot_card_cache_size, value, |_: usize| true)
            }
            "hot_card_threshold" => parse_into(&mut self.hot_card_threshold, value, |_: u8| true),
            "dcq_buffer_size" => parse_into(&mut self.dcq_buffer_size, value, |v: usize| v >= 1),
            "refinement_trigger_buffers" => {
                parse_into(&mut self.refinement_trigger_buffers, value, |_: usize| true)
            }
            _ => false,
        }
    }
}

const KEYS: &[&str] = &[
    "heap_size",
    "scan_block_size",
    "rebuild_chunk_size",
    "summarize_rset_stats",
    "flush_log_buffers_on_verify",
    "verify_rsets_during_full_gc",
    "trace_rebuild_rem_set",
    "parallel_gc_threads",
    "refinement_threads",
    "hot_card_cache_size",
    "hot_card_threshold",
    "dcq_buffer_size",
    "refinement_trigger_buffers",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_valid() {
        let mut options = Options::default();
        assert!(options.process("scan_block_size", "32"));
        assert_eq!(options.scan_block_size, 32);
        assert!(options.process("summarize_rset_stats", "true"));
        assert!(options.summarize_rset_stats);
    }

    #[test]
    fn process_rejects_invalid() {
        let mut options = Options::default();
        assert!(!options.process("scan_block_size", "0"));
        assert_eq!(options.scan_block_size, 64);
        assert!(!options.process("rebuild_chunk_size", "1000"));
        assert!(!options.process("no_such_option", "1"));
    }
}
