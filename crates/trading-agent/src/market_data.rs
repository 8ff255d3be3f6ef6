use analysis_core::Timeframe;
use broker_trait::ExchangeClient;
use technical_analysis::{compute_features, MultiTimeframeFeatures};

use crate::error::AgentError;

/// Fetch every timeframe and compute its features.
///
/// Any failed or empty series makes the whole cycle's data unavailable.
pub async fn fetch_features(
    exchange: &dyn ExchangeClient,
    symbol: &str,
    limit: usize,
) -> Result<MultiTimeframeFeatures, AgentError> {
    let mut features = MultiTimeframeFeatures::default();

    for timeframe in Timeframe::all() {
        let candles = exchange
            .get_candles(symbol, timeframe, limit)
            .await
            .map_err(|e| AgentError::DataUnavailable(format!("{} candles: {}", timeframe, e)))?;

        if candles.is_empty() {
            return Err(AgentError::DataUnavailable(format!(
                "{} candles: empty response",
                timeframe
            )));
        }

        let rows = compute_features(&candles);
        tracing::debug!(timeframe = %timeframe, rows = rows.len(), "Features computed");

        match timeframe {
            Timeframe::Hour1 => features.hour1 = rows,
            Timeframe::Min15 => features.min15 = rows,
            Timeframe::Min5 => features.min5 = rows,
        }
    }

    Ok(features)
}
