//! Aggregate operator classification and value expressions for the
//! attribute-map schemas.

use super::format::fixed;
use crate::error::{Result, ServiceError};
use crate::models::AggregateOperator;

impl AggregateOperator {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateOperator::Noop => "noop",
            AggregateOperator::Count => "count",
            AggregateOperator::CountDistinct => "count_distinct",
            AggregateOperator::Sum => "sum",
            AggregateOperator::Avg => "avg",
            AggregateOperator::Min => "min",
            AggregateOperator::Max => "max",
            AggregateOperator::P05 => "p05",
            AggregateOperator::P10 => "p10",
            AggregateOperator::P20 => "p20",
            AggregateOperator::P25 => "p25",
            AggregateOperator::P50 => "p50",
            AggregateOperator::P75 => "p75",
            AggregateOperator::P90 => "p90",
            AggregateOperator::P95 => "p95",
            AggregateOperator::P99 => "p99",
            AggregateOperator::Rate => "rate",
            AggregateOperator::SumRate => "sum_rate",
            AggregateOperator::AvgRate => "avg_rate",
            AggregateOperator::MaxRate => "max_rate",
            AggregateOperator::MinRate => "min_rate",
            AggregateOperator::RateSum => "rate_sum",
            AggregateOperator::RateAvg => "rate_avg",
            AggregateOperator::RateMax => "rate_max",
            AggregateOperator::RateMin => "rate_min",
            AggregateOperator::HistQuant50 => "hist_quantile_50",
            AggregateOperator::HistQuant75 => "hist_quantile_75",
            AggregateOperator::HistQuant90 => "hist_quantile_90",
            AggregateOperator::HistQuant95 => "hist_quantile_95",
            AggregateOperator::HistQuant99 => "hist_quantile_99",
        }
    }

    /// Quantile fraction of a percentile operator.
    pub fn percentile(self) -> Option<&'static str> {
        match self {
            AggregateOperator::P05 => Some("0.05"),
            AggregateOperator::P10 => Some("0.1"),
            AggregateOperator::P20 => Some("0.2"),
            AggregateOperator::P25 => Some("0.25"),
            AggregateOperator::P50 => Some("0.5"),
            AggregateOperator::P75 => Some("0.75"),
            AggregateOperator::P90 => Some("0.9"),
            AggregateOperator::P95 => Some("0.95"),
            AggregateOperator::P99 => Some("0.99"),
            _ => None,
        }
    }

    /// Quantile argument of a histogram quantile operator.
    pub fn histogram_quantile(self) -> Option<&'static str> {
        match self {
            AggregateOperator::HistQuant50 => Some("0.500"),
            AggregateOperator::HistQuant75 => Some("0.750"),
            AggregateOperator::HistQuant90 => Some("0.900"),
            AggregateOperator::HistQuant95 => Some("0.950"),
            AggregateOperator::HistQuant99 => Some("0.990"),
            _ => None,
        }
    }

    /// Aggregate function applied by the simple and rate-combined operators.
    pub fn sql_function(self) -> Option<&'static str> {
        match self {
            AggregateOperator::Sum | AggregateOperator::SumRate | AggregateOperator::RateSum => {
                Some("sum")
            }
            AggregateOperator::Avg | AggregateOperator::AvgRate | AggregateOperator::RateAvg => {
                Some("avg")
            }
            AggregateOperator::Min | AggregateOperator::MinRate | AggregateOperator::RateMin => {
                Some("min")
            }
            AggregateOperator::Max | AggregateOperator::MaxRate | AggregateOperator::RateMax => {
                Some("max")
            }
            _ => None,
        }
    }

    /// `sum_rate` style: rate per series first, then aggregate across series.
    pub fn is_aggregate_of_rate(self) -> bool {
        matches!(
            self,
            AggregateOperator::SumRate
                | AggregateOperator::AvgRate
                | AggregateOperator::MaxRate
                | AggregateOperator::MinRate
        )
    }

    /// `rate_sum` style: aggregate across series first, then rate.
    pub fn is_rate_of_aggregate(self) -> bool {
        matches!(
            self,
            AggregateOperator::RateSum
                | AggregateOperator::RateAvg
                | AggregateOperator::RateMax
                | AggregateOperator::RateMin
        )
    }

    /// Whether the aggregate attribute gets an implicit existence guard.
    ///
    /// Percentiles are excluded. This mirrors long-standing behavior and
    /// differs from avg/sum/min/max; see DESIGN.md before changing it.
    pub fn guards_value_attribute(self) -> bool {
        self.percentile().is_none() && self != AggregateOperator::Noop
    }
}

/// Seconds a rate is divided by, scaled to minutes when requested.
pub fn rate_denominator(seconds: i64, prefer_rpm: bool) -> f64 {
    let seconds = seconds as f64;
    if prefer_rpm {
        seconds / 60.0
    } else {
        seconds
    }
}

fn required<'a>(operator: AggregateOperator, attribute: &'a str) -> Result<&'a str> {
    if attribute.is_empty() {
        Err(ServiceError::invalid(format!(
            "aggregate attribute is required for {}",
            operator.as_str()
        )))
    } else {
        Ok(attribute)
    }
}

/// Value expression for logs and traces. `attribute` is the resolved column
/// expression (empty when the query has no aggregate attribute) and
/// `denominator` the rate divisor in seconds or minutes.
pub fn value_expression(
    operator: AggregateOperator,
    attribute: &str,
    denominator: f64,
) -> Result<String> {
    if let Some(fraction) = operator.percentile() {
        return Ok(format!(
            "quantile({fraction})({})",
            required(operator, attribute)?
        ));
    }

    let expr = match operator {
        AggregateOperator::Count => "toFloat64(count(*))".to_string(),
        AggregateOperator::CountDistinct => format!(
            "toFloat64(count(distinct({})))",
            required(operator, attribute)?
        ),
        AggregateOperator::Sum
        | AggregateOperator::Avg
        | AggregateOperator::Min
        | AggregateOperator::Max => {
            let func = operator.sql_function().unwrap_or("sum");
            format!("{func}({})", required(operator, attribute)?)
        }
        AggregateOperator::Rate => format!("count({attribute})/{}", fixed(denominator)),
        AggregateOperator::RateSum
        | AggregateOperator::RateAvg
        | AggregateOperator::RateMax
        | AggregateOperator::RateMin => {
            let func = operator.sql_function().unwrap_or("sum");
            format!(
                "{func}({})/{}",
                required(operator, attribute)?,
                fixed(denominator)
            )
        }
        other => {
            return Err(ServiceError::unsupported(format!(
                "unsupported aggregate operator {}",
                other.as_str()
            )))
        }
    };
    Ok(expr)
}
