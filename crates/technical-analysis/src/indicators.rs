use analysis_core::Candle;

/// Guards the RSI ratio against a zero average loss.
pub const RSI_EPSILON: f64 = 1e-9;

/// Exponential Moving Average with smoothing `2 / (period + 1)`.
///
/// Seeded by the first value and defined recursively from the start of the
/// series, so the output is aligned 1:1 with the input.
pub fn ema(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.is_empty() {
        return vec![];
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut result = Vec::with_capacity(data.len());
    let mut prev = data[0];
    result.push(prev);

    for &value in &data[1..] {
        prev = alpha * value + (1.0 - alpha) * prev;
        result.push(prev);
    }

    result
}

/// Trailing simple mean over `period` values, aligned with the input.
///
/// A slot is `None` until the window is full, and stays `None` while any
/// value inside the window is missing.
pub fn rolling_mean(data: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    if period == 0 {
        return vec![None; data.len()];
    }

    (0..data.len())
        .map(|i| {
            if i + 1 < period {
                return None;
            }
            let window = &data[i + 1 - period..=i];
            let mut sum = 0.0;
            for value in window {
                sum += (*value)?;
            }
            Some(sum / period as f64)
        })
        .collect()
}

/// Percent change between consecutive values. The first slot is `None`.
pub fn simple_returns(data: &[f64]) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(data.len());
    if data.is_empty() {
        return result;
    }
    result.push(None);
    for w in data.windows(2) {
        result.push(Some((w[1] - w[0]) / w[0]));
    }
    result
}

/// Relative Strength Index from rolling (simple) average gains and losses.
///
/// `RS = avg_gain / (avg_loss + 1e-9)`, `RSI = 100 - 100 / (1 + RS)`.
/// Aligned with the input; the first `period` slots are `None`.
pub fn rsi(data: &[f64], period: usize) -> Vec<Option<f64>> {
    if data.is_empty() {
        return vec![];
    }

    let mut gains = Vec::with_capacity(data.len());
    let mut losses = Vec::with_capacity(data.len());
    gains.push(None);
    losses.push(None);

    for w in data.windows(2) {
        let change = w[1] - w[0];
        gains.push(Some(change.max(0.0)));
        losses.push(Some((-change).max(0.0)));
    }

    let avg_gains = rolling_mean(&gains, period);
    let avg_losses = rolling_mean(&losses, period);

    avg_gains
        .iter()
        .zip(avg_losses.iter())
        .map(|(gain, loss)| match (gain, loss) {
            (Some(g), Some(l)) => {
                let rs = g / (l + RSI_EPSILON);
                Some(100.0 - 100.0 / (1.0 + rs))
            }
            _ => None,
        })
        .collect()
}

/// True range per candle. The first candle has no previous close, so its
/// range is just `high - low`.
pub fn true_range(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let high_low = c.high - c.low;
            if i == 0 {
                return high_low;
            }
            let prev_close = candles[i - 1].close;
            high_low
                .max((c.high - prev_close).abs())
                .max((c.low - prev_close).abs())
        })
        .collect()
}

/// Average True Range over `period` candles, as a fraction of each candle's close.
pub fn atr_percent(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    let tr: Vec<Option<f64>> = true_range(candles).into_iter().map(Some).collect();
    rolling_mean(&tr, period)
        .into_iter()
        .zip(candles.iter())
        .map(|(atr, c)| atr.map(|a| a / c.close))
        .collect()
}
