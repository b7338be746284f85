//! Statistics about the recompiler. The accuracy of the statistics varies: for example,
//! "durations" are wall-clock time, which inevitably fail to account for context switches and the
//! like. Thus the statistics are very much in "best effort" territory.

use parking_lot::Mutex;
#[cfg(not(test))]
use std::env;
use std::{
    cell::Cell,
    fs,
    time::{Duration, Instant},
};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// Record statistics if enabled. In non-testing mode, this is only enabled if the end user
/// defines the environment variable `DYNAREC_LOG_STATS`. In testing mode, this is always enabled,
/// with output being sent to `stderr`.
pub(crate) struct Stats {
    // Most runs won't record statistics, so the common case must be a cheap `None` check: only if
    // stats are to be recorded do we have to go to the expense of locking a `Mutex`.
    inner: Option<Mutex<StatsInner>>,
}

struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    /// How many blocks were translated?
    blocks_translated: u64,
    /// How many times was the whole cache flushed?
    cache_clears: u64,
    /// How many blocks were evicted by invalidation?
    blocks_invalidated: u64,
    /// How many faulting accesses were rewritten into slow-path calls?
    backpatches: u64,
    /// How many times did the dispatcher enter generated code?
    block_entries: u64,
    /// The time spent in each [TimingState].
    durations: [Duration; TimingState::COUNT],
}

impl Stats {
    #[cfg(not(test))]
    pub fn new() -> Self {
        if let Ok(p) = env::var("DYNAREC_LOG_STATS") {
            Self {
                inner: Some(Mutex::new(StatsInner::new(p))),
            }
        } else {
            Self { inner: None }
        }
    }

    #[cfg(test)]
    pub fn new() -> Self {
        Self {
            inner: Some(Mutex::new(StatsInner::new("-".to_string()))),
        }
    }

    /// If `DYNAREC_LOG_STATS` was specified, update `inner` by running the function `f`,
    /// otherwise return immediately without calling `f`.
    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(mtx) = &self.inner {
            f(&mut mtx.lock());
        }
    }

    pub fn block_translated(&self) {
        self.update_with(|inner| inner.blocks_translated += 1);
    }

    pub fn cache_cleared(&self) {
        self.update_with(|inner| inner.cache_clears += 1);
    }

    pub fn blocks_invalidated(&self, n: usize) {
        self.update_with(|inner| inner.blocks_invalidated += n as u64);
    }

    pub fn backpatched(&self, n: u64) {
        self.update_with(|inner| inner.backpatches += n);
    }

    pub fn block_entered(&self) {
        self.update_with(|inner| inner.block_entries += 1);
    }

    /// Change the [TimingState] the current thread is in.
    pub fn timing_state(&self, new_state: TimingState) {
        self.update_with(|inner| {
            let now = Instant::now();
            let (prev_state, then) = CORE_STATE.replace((new_state, now));
            let d = now.saturating_duration_since(then);
            inner.durations[prev_state as usize] =
                inner.durations[prev_state as usize].saturating_add(d);
        });
    }

    /// Output these statistics to the appropriate output path.
    pub(crate) fn output(&self) {
        self.update_with(|inner| inner.output());
    }

    #[cfg(test)]
    pub(crate) fn to_json(&self) -> String {
        self.inner
            .as_ref()
            .map(|x| x.lock().to_json())
            .unwrap_or_default()
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            blocks_translated: 0,
            cache_clears: 0,
            blocks_invalidated: 0,
            backpatches: 0,
            block_entries: 0,
            durations: [Duration::new(0, 0); TimingState::COUNT],
        }
    }

    /// Output these statistics to the appropriate output path.
    fn output(&self) {
        let json = self.to_json();
        if self.output_path == "-" {
            eprintln!("{json}");
        } else {
            fs::write(&self.output_path, json).ok();
        }
    }

    /// Turn these statistics into JSON. The output is guaranteed to be sorted by field name so
    /// that textual matching of the JSON string is possible.
    fn to_json(&self) -> String {
        fn fmt_duration(d: Duration) -> String {
            format!("{}.{:03}", d.as_secs(), d.subsec_millis())
        }

        let mut fields = vec![
            (
                "blocks_translated".to_owned(),
                self.blocks_translated.to_string(),
            ),
            ("cache_clears".to_owned(), self.cache_clears.to_string()),
            (
                "blocks_invalidated".to_owned(),
                self.blocks_invalidated.to_string(),
            ),
            ("backpatches".to_owned(), self.backpatches.to_string()),
            ("block_entries".to_owned(), self.block_entries.to_string()),
        ];
        for v in TimingState::iter() {
            let s = v.to_string();
            if !s.is_empty() {
                fields.push((s, fmt_duration(self.durations[v as usize])));
            }
        }
        // We sort the output fields so that tests can match the output with a simple text match.
        fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            r#"{{
    {}
}}"#,
            fields
                .iter()
                .map(|(x, y)| format!(r#""{x}": {y}"#))
                .collect::<Vec<_>>()
                .join(",\n    ")
        )
    }
}

/// The different timing states a core can go through.
#[repr(u8)]
#[derive(Copy, Clone, Display, EnumCount, EnumIter)]
// New states must keep the variants in `0..TimingState::COUNT` (i.e. no explicit discriminants)
// and give a `strum` `to_string` naming their JSON key. An empty `to_string` hides the state from
// the JSON output.
pub(crate) enum TimingState {
    /// The "we don't know what this thread is doing" state. Time spent in this state is not
    /// counted towards anything and is not displayed to the user.
    #[strum(to_string = "")]
    None,
    /// Translating guest code.
    #[strum(to_string = "duration_compiling")]
    Compiling,
    /// In the dispatcher: lookups, invalidation, timing and exception delivery.
    #[strum(to_string = "duration_dispatching")]
    Dispatching,
    /// Executing generated code (including slow paths called from it).
    #[strum(to_string = "duration_executing")]
    Executing,
}

thread_local! {
    static CORE_STATE: Cell<(TimingState, Instant)> = Cell::new((TimingState::None, Instant::now()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use fm::FMBuilder;

    #[test]
    fn json_is_sorted() {
        let s = Stats::new();
        s.block_translated();
        s.block_translated();
        s.backpatched(1);
        s.timing_state(TimingState::Compiling);
        s.timing_state(TimingState::None);
        let fm = FMBuilder::new(
            r#"{
    "backpatches": 1,
    "block_entries": 0,
    "blocks_invalidated": 0,
    "blocks_translated": 2,
    "cache_clears": 0,
    "duration_compiling": ...,
    "duration_dispatching": ...,
    "duration_executing": ...
}"#,
        )
        .unwrap()
        .build()
        .unwrap();
        fm.matches(&s.to_json()).unwrap();
    }
}
