//! Season boundaries and variance injection.
//!
//! Which season a date belongs to is a calendar convention, so it sits
//! behind [`SeasonCalendar`]. [`MonthBoundaryCalendar`] is the default for
//! leagues whose season straddles the new year.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use tracing::{debug, info};

use crate::config::{BayesianConfig, SeasonConfig};
use crate::error::{CoreError, Result};
use crate::models::{SeasonTransitionRecord, TeamPosterior};

pub trait SeasonCalendar: Send + Sync {
    /// Season label for a game date, e.g. "2024-25".
    fn season_for(&self, date: NaiveDate) -> String;

    /// Start year of a season label, or `None` if it cannot be parsed.
    fn start_year(&self, season: &str) -> Option<i32>;
}

/// Seasons start on the first day of `boundary_month`.
///
/// Dates in or after the boundary month belong to the season starting that
/// year ("2024-25" for 2024-11-15); earlier dates belong to the season that
/// started the previous year ("2023-24" for 2024-02-01).
#[derive(Debug, Clone, Copy)]
pub struct MonthBoundaryCalendar {
    boundary_month: u32,
}

impl MonthBoundaryCalendar {
    pub fn new(boundary_month: u32) -> Self {
        Self { boundary_month }
    }

    pub fn label(start_year: i32) -> String {
        format!("{}-{:02}", start_year, (start_year + 1).rem_euclid(100))
    }
}

impl Default for MonthBoundaryCalendar {
    fn default() -> Self {
        Self::new(SeasonConfig::default().boundary_month)
    }
}

impl SeasonCalendar for MonthBoundaryCalendar {
    fn season_for(&self, date: NaiveDate) -> String {
        let start = if date.month() >= self.boundary_month {
            date.year()
        } else {
            date.year() - 1
        };
        Self::label(start)
    }

    /// Accepts "2024-25" and "2024-2025".
    fn start_year(&self, season: &str) -> Option<i32> {
        let (start, end) = season.trim().split_once('-')?;
        let start: i32 = start.parse().ok()?;
        let end_ok = match end.len() {
            2 => end.parse::<i32>().ok()? == (start + 1).rem_euclid(100),
            4 => end.parse::<i32>().ok()? == start + 1,
            _ => false,
        };
        end_ok.then_some(start)
    }
}

/// What the season check decided for one team and game.
#[derive(Debug, Clone, PartialEq)]
pub enum SeasonCheck {
    /// Team has no recorded season yet.
    FirstSeason { season: String },
    SameSeason,
    /// Game is in a later season than the recorded one.
    NewSeason { from: String, to: String },
    /// Game is from an earlier season than the recorded one.
    Backfill { season: String, seasons_ago: i32 },
}

/// Posterior after the season step plus the observation weight to use.
#[derive(Debug, Clone)]
pub struct SeasonAdjustment {
    pub posterior: TeamPosterior,
    pub observation_weight: f64,
    pub check: SeasonCheck,
}

#[derive(Clone)]
pub struct SeasonTransitionManager {
    config: SeasonConfig,
    min_uncertainty: f64,
    max_uncertainty: f64,
    calendar: Arc<dyn SeasonCalendar>,
}

impl SeasonTransitionManager {
    pub fn new(config: SeasonConfig, bayes: &BayesianConfig) -> Self {
        let calendar = Arc::new(MonthBoundaryCalendar::new(config.boundary_month));
        Self::with_calendar(config, bayes, calendar)
    }

    pub fn with_calendar(
        config: SeasonConfig,
        bayes: &BayesianConfig,
        calendar: Arc<dyn SeasonCalendar>,
    ) -> Self {
        Self {
            config,
            min_uncertainty: bayes.min_uncertainty,
            max_uncertainty: bayes.max_uncertainty,
            calendar,
        }
    }

    pub fn season_for(&self, date: NaiveDate) -> String {
        self.calendar.season_for(date)
    }

    pub fn check(&self, posterior: &TeamPosterior, game_date: NaiveDate) -> Result<SeasonCheck> {
        let season = self.season_for(game_date);
        if posterior.last_season.is_empty() {
            return Ok(SeasonCheck::FirstSeason { season });
        }
        if posterior.last_season == season {
            return Ok(SeasonCheck::SameSeason);
        }

        let failure = |reason: String| CoreError::SeasonTransitionFailure {
            team_id: posterior.team_id.clone(),
            reason,
        };
        let recorded = self
            .calendar
            .start_year(&posterior.last_season)
            .ok_or_else(|| {
                failure(format!("unparseable last season {:?}", posterior.last_season))
            })?;
        let current = self
            .calendar
            .start_year(&season)
            .ok_or_else(|| failure(format!("calendar produced unparseable season {season:?}")))?;

        Ok(if current > recorded {
            SeasonCheck::NewSeason {
                from: posterior.last_season.clone(),
                to: season,
            }
        } else {
            SeasonCheck::Backfill {
                season,
                seasons_ago: recorded - current,
            }
        })
    }

    /// `crossSeasonDecay^seasonsAgo`, 1.0 for non-positive ages.
    pub fn backfill_weight(&self, seasons_ago: i32) -> f64 {
        if seasons_ago <= 0 {
            1.0
        } else {
            self.config.cross_season_decay.powi(seasons_ago)
        }
    }

    /// Add inter-year variance to every σ_i, leaving μ untouched.
    pub fn inject_variance(
        &self,
        posterior: &TeamPosterior,
        from: &str,
        to: &str,
        transition_date: NaiveDate,
    ) -> TeamPosterior {
        let delta = self.config.inter_year_variance;
        let mut next = posterior.clone();
        for s in next.sigma.iter_mut() {
            *s = (*s * *s + delta)
                .sqrt()
                .clamp(self.min_uncertainty, self.max_uncertainty);
        }
        next.last_season = to.to_string();
        next.transition_history.push(SeasonTransitionRecord {
            from_season: from.to_string(),
            to_season: to.to_string(),
            transition_date,
            variance_added: delta,
        });
        next
    }

    /// Run the season step for one team ahead of its update.
    pub fn prepare(
        &self,
        posterior: &TeamPosterior,
        game_date: NaiveDate,
    ) -> Result<SeasonAdjustment> {
        let check = self.check(posterior, game_date)?;
        let (next, weight) = match &check {
            SeasonCheck::FirstSeason { season } => {
                let mut next = posterior.clone();
                next.last_season = season.clone();
                (next, 1.0)
            }
            SeasonCheck::SameSeason => (posterior.clone(), 1.0),
            SeasonCheck::NewSeason { from, to } => {
                let next = self.inject_variance(posterior, from, to, game_date);
                info!(
                    team_id = %posterior.team_id,
                    from = %from,
                    to = %to,
                    variance_added = self.config.inter_year_variance,
                    "Season transition"
                );
                (next, 1.0)
            }
            SeasonCheck::Backfill { season, seasons_ago } => {
                let weight = self.backfill_weight(*seasons_ago);
                debug!(
                    team_id = %posterior.team_id,
                    season = %season,
                    seasons_ago,
                    weight,
                    "Backfill game down-weighted"
                );
                (posterior.clone(), weight)
            }
        };
        Ok(SeasonAdjustment {
            posterior: next,
            observation_weight: weight,
            check,
        })
    }
}

impl std::fmt::Debug for SeasonTransitionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeasonTransitionManager")
            .field("config", &self.config)
            .field("min_uncertainty", &self.min_uncertainty)
            .field("max_uncertainty", &self.max_uncertainty)
            .finish_non_exhaustive()
    }
}
