use crate::scheduler::SaveStatistics;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message recorded as the informational error after a backup restore.
pub const RECOVERED_FROM_BACKUP: &str = "Recovered from backup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl SystemHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Unhealthy => "UNHEALTHY",
        }
    }

    /// Status of a single dataset: unhealthy wins, and a healthy dataset
    /// that still carries an error message (a recovery note) is degraded.
    pub fn classify(healthy: bool, last_error: Option<&str>) -> Self {
        match (healthy, last_error) {
            (false, _) => Self::Unhealthy,
            (true, Some(_)) => Self::Degraded,
            (true, None) => Self::Healthy,
        }
    }
}

impl fmt::Display for SystemHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time health of one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetHealth {
    pub name: String,
    pub healthy: bool,
    pub last_error: Option<String>,
    pub health_details: String,
    pub backup_count: usize,
    pub status: SystemHealth,
}

impl fmt::Display for DatasetHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.status)?;
        if let Some(error) = &self.last_error {
            write!(f, " - last error: {}", error)?;
        }
        if !self.health_details.is_empty() {
            write!(f, " - {}", self.health_details)?;
        }
        write!(f, " ({} backups available)", self.backup_count)
    }
}

/// Aggregate health of every dataset known to a scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub datasets: Vec<DatasetHealth>,
    pub statistics: SaveStatistics,
    pub overall: SystemHealth,
}

impl HealthReport {
    pub fn new(datasets: Vec<DatasetHealth>, statistics: SaveStatistics) -> Self {
        let overall = datasets
            .iter()
            .map(|dataset| dataset.status)
            .max()
            .unwrap_or(SystemHealth::Healthy);
        Self {
            datasets,
            statistics,
            overall,
        }
    }

    pub fn unhealthy(&self) -> impl Iterator<Item = &DatasetHealth> {
        self.datasets
            .iter()
            .filter(|dataset| dataset.status == SystemHealth::Unhealthy)
    }

    pub fn summary(&self) -> String {
        let count = |status: SystemHealth| {
            self.datasets
                .iter()
                .filter(|dataset| dataset.status == status)
                .count()
        };
        format!(
            "{} - {} datasets ({} healthy, {} degraded, {} unhealthy), {} dirty, {} saves",
            self.overall,
            self.datasets.len(),
            count(SystemHealth::Healthy),
            count(SystemHealth::Degraded),
            count(SystemHealth::Unhealthy),
            self.statistics.dirty,
            self.statistics.total_saves,
        )
    }
}
