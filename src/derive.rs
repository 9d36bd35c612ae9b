use crate::buffer::merge_buffer::MergeBuffer;
use crate::types::metric::Metric;
use crate::types::observation::Observation;

/// Perceived temperature in °C for air temperature `t` (°C) and wind speed
/// `v` (km/h). Outside `t < 10` and `v > 4.8` the air temperature is returned.
pub fn wind_chill(t: f64, v: f64) -> f64 {
    if t < 10.0 && v > 4.8 {
        let v16 = v.powf(0.16);
        13.12 + 0.6215 * t - 11.37 * v16 + 0.3965 * t * v16
    } else {
        t
    }
}

/// Wind chill for every buffered temperature with a wind value at the same
/// timestamp, rounded to one decimal.
pub fn derive_wind_chill(buffer: &MergeBuffer) -> Vec<Observation> {
    buffer
        .observations(Metric::Temperature)
        .into_iter()
        .filter_map(|temperature| {
            let wind = buffer.get(Metric::Wind, temperature.timestamp)?;
            let chill = (wind_chill(temperature.value, wind) * 10.0).round() / 10.0;
            Some(Observation::new(Metric::WindChill, temperature.timestamp, chill))
        })
        .collect()
}
