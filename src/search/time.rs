// src/search/time.rs
//
// Time management with soft/hard bounds. The manager computes an optimum
// (soft) and maximum (hard) budget from the clock state at search start;
// the iterative-deepening loop scales the optimum each iteration by the
// falling-eval, best-move-stability and PV-instability factors before
// deciding whether to stop.

use crate::search::SearchLimits;
use chess::Color;
use std::time::Instant;

pub struct TimeManager {
    start_time: Instant,
    /// Optimum time (soft bound) in ms; zero when not managing time.
    optimum_ms: f64,
    /// Maximum time (hard bound) in ms.
    maximum_ms: f64,
    active: bool,
}

impl TimeManager {
    pub fn new(limits: &SearchLimits, us: Color, game_ply: i32, move_overhead: i64) -> Self {
        let start_time = limits.start_time;
        if !limits.use_time_management() {
            // Fixed movetime still gets a hard bound.
            let cap = limits.movetime.unwrap_or(0) as f64;
            return Self {
                start_time,
                optimum_ms: cap,
                maximum_ms: cap,
                active: limits.movetime.is_some(),
            };
        }

        let time_ms = limits.time[us.to_index()].max(1) as f64;
        let inc_ms = limits.inc[us.to_index()].max(0) as f64;
        let overhead = move_overhead as f64;
        let ply = game_ply as f64;

        // Estimate moves to go if not given (sudden death): start near 50
        // and decrease toward 20 as the game progresses.
        let mtg = if limits.movestogo > 0 {
            limits.movestogo as f64
        } else {
            (50.0 - ply * 0.4).clamp(20.0, 50.0)
        };

        // Total time available for this move (pool)
        let time_left = (time_ms + inc_ms * (mtg - 1.0) - overhead * mtg).max(1.0);

        let (opt, max) = if limits.movestogo == 0 {
            // Sudden death / increment: ply-aware scaling.
            let ply_factor = (0.015 + (ply + 3.0).powf(0.45) * 0.01).min(0.20);
            let opt = ply_factor * time_left;
            let max = (5.5 * opt).min(0.80 * time_ms - overhead);
            (opt, max)
        } else {
            let opt = (0.90 + ply / 120.0).min(0.90) * time_left / mtg;
            let max = (1.5 + 0.12 * mtg) * opt;
            (opt, max)
        };

        let optimum = opt.max(10.0);
        let maximum = max.max(optimum).min(time_ms - overhead).max(10.0);

        Self {
            start_time,
            optimum_ms: optimum,
            maximum_ms: maximum,
            active: true,
        }
    }

    #[inline]
    pub fn elapsed_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }

    #[inline]
    pub fn optimum(&self) -> i64 {
        self.optimum_ms as i64
    }

    #[inline]
    pub fn maximum(&self) -> i64 {
        self.maximum_ms as i64
    }

    /// Hard stop, checked from the periodic node-count poll.
    #[inline]
    pub fn out_of_time(&self) -> bool {
        self.active && self.elapsed_ms() > self.maximum() - 10
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits_with_clock(wtime: i64, winc: i64) -> SearchLimits {
        SearchLimits {
            time: [wtime, wtime],
            inc: [winc, winc],
            ..SearchLimits::default()
        }
    }

    #[test]
    fn budgets_are_ordered_and_bounded() {
        let limits = limits_with_clock(60_000, 1_000);
        let tm = TimeManager::new(&limits, Color::White, 20, 30);
        assert!(tm.optimum() >= 10);
        assert!(tm.maximum() >= tm.optimum());
        assert!(tm.maximum() < 60_000);
    }

    #[test]
    fn short_clocks_leave_a_usable_budget() {
        let limits = limits_with_clock(150, 0);
        let tm = TimeManager::new(&limits, Color::Black, 60, 30);
        assert!(tm.optimum() >= 10);
        assert!(tm.maximum() <= 150);
    }

    #[test]
    fn classical_controls_scale_with_moves_to_go() {
        let mut limits = limits_with_clock(120_000, 0);
        limits.movestogo = 40;
        let tm40 = TimeManager::new(&limits, Color::White, 10, 30);
        limits.movestogo = 2;
        let tm2 = TimeManager::new(&limits, Color::White, 10, 30);
        assert!(tm2.optimum() > tm40.optimum());
    }

    #[test]
    fn infinite_search_has_no_active_deadline() {
        let limits = SearchLimits {
            infinite: true,
            ..SearchLimits::default()
        };
        let tm = TimeManager::new(&limits, Color::White, 0, 30);
        assert!(!tm.out_of_time());
    }
}
