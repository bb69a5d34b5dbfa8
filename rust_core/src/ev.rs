//! Expected-value screening of market odds against simulated probabilities.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EvConfig;
use crate::models::{BetSide, BettingOdds, MarketKind};
use crate::simulation::SimulationResult;

/// Convert American odds to implied probability
/// Positive odds (+150) mean you win $150 on a $100 bet
/// Negative odds (-150) mean you need to bet $150 to win $100
///
/// Returns `None` for prices inside (-100, +100), which are not valid
/// American odds.
pub fn american_odds_to_probability(odds: i32) -> Option<f64> {
    if odds >= 100 {
        Some(100.0 / (odds as f64 + 100.0))
    } else if odds <= -100 {
        let abs_odds = -(odds as f64);
        Some(abs_odds / (abs_odds + 100.0))
    } else {
        None
    }
}

/// Profit per unit stake when the bet wins.
pub fn payout_per_unit(odds: i32) -> f64 {
    if odds > 0 {
        odds as f64 / 100.0
    } else {
        100.0 / (odds as f64).abs()
    }
}

/// EV per unit stake: p·payout − (1 − p)·1.
pub fn expected_value(sim_prob: f64, odds: i32) -> f64 {
    sim_prob * payout_per_unit(odds) - (1.0 - sim_prob)
}

/// One priced side of one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketEvaluation {
    pub market: MarketKind,
    pub side: BetSide,
    /// Spread or total line; `None` for moneyline.
    pub line: Option<f64>,
    pub odds: i32,
    pub sim_prob: f64,
    pub implied_prob: f64,
    /// sim_prob − implied_prob
    pub edge: f64,
    pub expected_value: f64,
    pub confidence: f64,
    pub is_opportunity: bool,
}

#[derive(Debug, Clone)]
pub struct ExpectedValueCalculator {
    config: EvConfig,
}

impl ExpectedValueCalculator {
    pub fn new(config: EvConfig) -> Self {
        Self { config }
    }

    fn evaluate(
        &self,
        market: MarketKind,
        side: BetSide,
        line: Option<f64>,
        odds: Option<i32>,
        sim_prob: f64,
        confidence: f64,
    ) -> Option<MarketEvaluation> {
        let odds = odds?;
        let Some(implied_prob) = american_odds_to_probability(odds) else {
            warn!(?market, ?side, odds, "Ignoring invalid American odds");
            return None;
        };
        let edge = sim_prob - implied_prob;
        Some(MarketEvaluation {
            market,
            side,
            line,
            odds,
            sim_prob,
            implied_prob,
            edge,
            expected_value: expected_value(sim_prob, odds),
            confidence,
            is_opportunity: edge >= self.config.min_ev_threshold,
        })
    }

    /// Every side the odds price, in market order.
    pub fn evaluate_all(
        &self,
        sim: &SimulationResult,
        odds: &BettingOdds,
        confidence: f64,
    ) -> Vec<MarketEvaluation> {
        let mut out = Vec::new();

        // Ties go to overtime; split them evenly.
        let home_ml = sim.home_win_prob + sim.tie_prob / 2.0;
        let away_ml = sim.away_win_prob + sim.tie_prob / 2.0;
        out.extend(self.evaluate(
            MarketKind::Moneyline,
            BetSide::Home,
            None,
            odds.home_moneyline,
            home_ml,
            confidence,
        ));
        out.extend(self.evaluate(
            MarketKind::Moneyline,
            BetSide::Away,
            None,
            odds.away_moneyline,
            away_ml,
            confidence,
        ));

        if let Some(spread) = odds.spread_line {
            out.extend(self.evaluate(
                MarketKind::Spread,
                BetSide::Home,
                Some(spread),
                odds.home_spread_odds,
                sim.prob_home_cover(spread),
                confidence,
            ));
            out.extend(self.evaluate(
                MarketKind::Spread,
                BetSide::Away,
                Some(spread),
                odds.away_spread_odds,
                sim.prob_away_cover(spread),
                confidence,
            ));
        }

        if let Some(total) = odds.total_line {
            out.extend(self.evaluate(
                MarketKind::Total,
                BetSide::Over,
                Some(total),
                odds.over_odds,
                sim.prob_over(total),
                confidence,
            ));
            out.extend(self.evaluate(
                MarketKind::Total,
                BetSide::Under,
                Some(total),
                odds.under_odds,
                sim.prob_under(total),
                confidence,
            ));
        }
        out
    }

    /// Flagged opportunities, best edge first.
    pub fn find_opportunities(
        &self,
        sim: &SimulationResult,
        odds: &BettingOdds,
        confidence: f64,
    ) -> Vec<MarketEvaluation> {
        let mut opportunities: Vec<MarketEvaluation> = self
            .evaluate_all(sim, odds, confidence)
            .into_iter()
            .filter(|e| e.is_opportunity)
            .collect();
        opportunities.sort_by(|a, b| b.edge.total_cmp(&a.edge));
        debug!(count = opportunities.len(), "EV opportunities found");
        opportunities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim_with(home_win: f64, tie: f64) -> SimulationResult {
        SimulationResult {
            n_simulations: 10,
            seed: 0,
            home_court_advantage: 0.0,
            home_win_prob: home_win,
            away_win_prob: 1.0 - home_win - tie,
            tie_prob: tie,
            mean_margin: 0.0,
            margin_variance: 0.0,
            mean_home_score: 0.0,
            mean_away_score: 0.0,
            mean_total: 0.0,
            // home wins by 10 in 7 of 10 games, loses by 5 otherwise; totals 150
            home_scores: vec![80, 80, 80, 80, 80, 80, 80, 72, 72, 72],
            away_scores: vec![70, 70, 70, 70, 70, 70, 70, 77, 77, 77],
        }
    }

    fn odds() -> BettingOdds {
        BettingOdds {
            home_moneyline: Some(-150),
            away_moneyline: Some(130),
            spread_line: Some(-5.5),
            home_spread_odds: Some(-110),
            away_spread_odds: Some(-110),
            total_line: Some(140.5),
            over_odds: Some(-110),
            under_odds: Some(-110),
        }
    }

    #[test]
    fn test_implied_probability() {
        assert!((american_odds_to_probability(-150).unwrap() - 0.6).abs() < 1e-12);
        assert!((american_odds_to_probability(150).unwrap() - 0.4).abs() < 1e-12);
        assert!((american_odds_to_probability(100).unwrap() - 0.5).abs() < 1e-12);
        assert!(american_odds_to_probability(50).is_none());
        assert!(american_odds_to_probability(0).is_none());
    }

    #[test]
    fn test_two_sided_markets_carry_vig() {
        for (home, away) in [(-150, 130), (-110, -110), (-300, 240), (105, -125)] {
            let total = american_odds_to_probability(home).unwrap()
                + american_odds_to_probability(away).unwrap();
            assert!(total > 1.0, "{home}/{away} sums to {total}");
        }
    }

    #[test]
    fn test_expected_value() {
        assert!((expected_value(0.6, -150) - 0.0).abs() < 1e-12);
        assert!((expected_value(0.7, -150) - (0.7 * (100.0 / 150.0) - 0.3)).abs() < 1e-12);
        assert!(expected_value(0.4, -150) < 0.0);
        assert!((payout_per_unit(150) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_home_moneyline_edge_detected() {
        let calc = ExpectedValueCalculator::new(EvConfig::default());
        let found = calc.find_opportunities(&sim_with(0.70, 0.0), &odds(), 0.8);
        let ml = found
            .iter()
            .find(|o| o.market == MarketKind::Moneyline && o.side == BetSide::Home)
            .unwrap();
        assert!((ml.edge - 0.10).abs() < 1e-9);
        assert!(ml.expected_value > 0.0);
        assert_eq!(ml.confidence, 0.8);
    }

    #[test]
    fn test_ranked_by_edge_and_thresholded() {
        let calc = ExpectedValueCalculator::new(EvConfig::default());
        let found = calc.find_opportunities(&sim_with(0.70, 0.0), &odds(), 0.5);
        assert!(found.windows(2).all(|w| w[0].edge >= w[1].edge));
        assert!(found.iter().all(|o| o.edge >= 0.05));
        // every game goes over 140.5
        assert_eq!(found[0].side, BetSide::Over);
        assert!(found.iter().all(|o| o.side != BetSide::Away));
    }

    #[test]
    fn test_missing_prices_skipped() {
        let calc = ExpectedValueCalculator::new(EvConfig::default());
        let odds = BettingOdds {
            home_moneyline: Some(-150),
            away_moneyline: None,
            spread_line: None,
            home_spread_odds: Some(-110),
            away_spread_odds: Some(-110),
            total_line: None,
            over_odds: None,
            under_odds: None,
        };
        let all = calc.evaluate_all(&sim_with(0.5, 0.0), &odds, 0.5);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].market, MarketKind::Moneyline);
    }
}
