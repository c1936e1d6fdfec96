use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Classification written into `students.risk_prediction` by the external
/// scoring job. A missing value means the row has not been scored yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RiskPrediction {
    High,
    Low,
}

impl RiskPrediction {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskPrediction::High => "High",
            RiskPrediction::Low => "Low",
        }
    }
}

impl fmt::Display for RiskPrediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRiskPrediction(pub String);

impl fmt::Display for UnknownRiskPrediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown risk prediction {:?}", self.0)
    }
}

impl std::error::Error for UnknownRiskPrediction {}

impl FromStr for RiskPrediction {
    type Err = UnknownRiskPrediction;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "High" => Ok(RiskPrediction::High),
            "Low" => Ok(RiskPrediction::Low),
            other => Err(UnknownRiskPrediction(other.to_string())),
        }
    }
}

/// Badge text shown next to a student.
pub fn badge_label(risk: Option<RiskPrediction>) -> &'static str {
    match risk {
        Some(RiskPrediction::High) => "High Risk",
        Some(RiskPrediction::Low) => "On Track",
        None => "Processing...",
    }
}

/// Parses the stored column value. Anything other than `High`/`Low` is
/// treated as unscored rather than failing the whole page.
pub fn from_column(value: Option<&str>) -> Option<RiskPrediction> {
    match value.map(str::parse::<RiskPrediction>) {
        Some(Ok(risk)) => Some(risk),
        Some(Err(err)) => {
            tracing::warn!(%err, "ignoring unrecognized risk_prediction value");
            None
        }
        None => None,
    }
}
