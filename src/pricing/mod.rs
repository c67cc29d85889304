//! Black-76 pricing for index options.
//!
//! Strategies price options off the synthetic future (`strike + ce - pe`),
//! so the kernel applies a flat discount factor and no forward adjustment.
//! Implied volatility is recovered by interpolated bisection.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

const TRADING_START_HOUR: u32 = 9;
const TRADING_START_MINUTE: u32 = 15;
const TRADING_END_HOUR: u32 = 15;
const TRADING_END_MINUTE: u32 = 30;

/// Full session length in milliseconds (09:15 to 15:30).
const FULL_TRADING_DAY_MS: f64 = (((TRADING_END_HOUR * 60 + TRADING_END_MINUTE)
    - (TRADING_START_HOUR * 60 + TRADING_START_MINUTE))
    * 60
    * 1000) as f64;

/// Option side, `CE` or `PE` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    fn sign(self) -> f64 {
        match self {
            OptionType::Call => 1.0,
            OptionType::Put => -1.0,
        }
    }
}

/// Value and sensitivities returned together from a single evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Greeks {
    pub value: f64,
    pub delta: f64,
    pub gamma: f64,
    /// Per 1% move in volatility.
    pub vega: f64,
    /// Per calendar day.
    pub theta: f64,
    /// Per 1% move in rates.
    pub rho: f64,
}

fn norm_pdf(x: f64) -> f64 {
    (-(x * x) / 2.0).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Standard normal CDF, Abramowitz-Stegun 5-term rational approximation.
fn norm_cdf(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.2316419 * x.abs());
    let a1 = 0.319381530;
    let a2 = -0.356563782;
    let a3 = 1.781477937;
    let a4 = -1.821255978;
    let a5 = 1.330274429;
    let result = 1.0
        - norm_pdf(x)
            * (a1 * t + a2 * t.powi(2) + a3 * t.powi(3) + a4 * t.powi(4) + a5 * t.powi(5));
    if x >= 0.0 {
        result
    } else {
        1.0 - result
    }
}

/// Black-76 model with a flat interest rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct Black76 {
    pub interest_rate: f64,
}

impl Black76 {
    fn d1_d2(&self, underlying: f64, strike: f64, t: f64, vol: f64) -> (f64, f64) {
        let d1 = ((underlying / strike).ln() + (vol.powi(2) / 2.0) * t) / (vol * t.sqrt());
        let d2 = d1 - vol * t.sqrt();
        (d1, d2)
    }

    /// Evaluate value plus all greeks at one point.
    ///
    /// `t` is the time to maturity in years.
    pub fn greeks(
        &self,
        option_type: OptionType,
        underlying: f64,
        strike: f64,
        t: f64,
        vol: f64,
    ) -> Greeks {
        let discount = (-self.interest_rate * t).exp();
        let (d1, d2) = self.d1_d2(underlying, strike, t, vol);
        let sign = option_type.sign();
        let nd1 = norm_cdf(d1 * sign);
        let nd2 = norm_cdf(d2 * sign);
        let pdf = norm_pdf(d1);
        let sqrt_t = t.sqrt();

        let value = sign * discount * (underlying * nd1 - strike * nd2);
        let delta = sign * discount * nd1;
        let gamma = discount * (pdf / (vol * underlying * sqrt_t));
        let vega = 0.01 * underlying * discount * pdf * sqrt_t;
        let theta = (-underlying * discount * pdf * (vol / (2.0 * sqrt_t))
            + sign * self.interest_rate * discount * (underlying * nd1 - strike * nd2))
            / 365.0;
        let rho = -0.01 * t * value;

        Greeks {
            value,
            delta,
            gamma,
            vega,
            theta,
            rho,
        }
    }

    /// Recover implied volatility from a market price by bisection.
    ///
    /// The bracket is hard-coded to `[1e-5, 5.0]`; each iteration interpolates
    /// a guess between the bracket values, clamps it, and tightens the side
    /// whose value sits on the same side of the market price. Stops when the
    /// bracket closes (width <= 1e-4 with equal boundary values) or after 100
    /// iterations.
    pub fn implied_vol_bisection(
        &self,
        option_type: OptionType,
        underlying: f64,
        strike: f64,
        t: f64,
        market_price: f64,
    ) -> f64 {
        let epsilon = 0.0001;
        let max_iterations = 100;
        let mut vol_min = 0.00001;
        let mut vol_max = 5.0;
        let mut vol_guess = vol_min;

        for _ in 0..max_iterations {
            let value_min = self
                .greeks(option_type, underlying, strike, t, vol_min)
                .value;
            let value_max = self
                .greeks(option_type, underlying, strike, t, vol_max)
                .value;

            if vol_max - vol_min <= epsilon && value_min == value_max {
                break;
            }

            let interpolated =
                vol_min + (vol_max - vol_min) * ((market_price - value_min) / (value_max - value_min));
            vol_guess = interpolated.clamp(vol_min, vol_max);
            let value_guess = self
                .greeks(option_type, underlying, strike, t, vol_guess)
                .value;

            if value_guess < market_price {
                vol_min = vol_guess;
            } else {
                vol_max = vol_guess;
            }
        }

        vol_guess
    }
}

fn session_bounds(day: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
    let start = NaiveTime::from_hms_opt(TRADING_START_HOUR, TRADING_START_MINUTE, 0)
        .expect("valid session open");
    let end = NaiveTime::from_hms_opt(TRADING_END_HOUR, TRADING_END_MINUTE, 0)
        .expect("valid session close");
    (day.and_time(start), day.and_time(end))
}

/// Time to expiry in broker "days", the unit fed to [`Black76`] after
/// dividing by 365.
///
/// On expiry day this is the fraction of the 09:15-15:30 session remaining
/// (1 before the open, 1e-7 after the close). For longer horizons the day
/// count convention is the whole-hour span between the two midnights, plus
/// one while today's session has not yet closed; this matches the broker's
/// quoting convention and must not be "fixed" to calendar days.
pub fn time_to_expiry_days(expiry: NaiveDate, today: NaiveDate, now: NaiveDateTime) -> f64 {
    let (session_start, session_end) = session_bounds(today);

    if today == expiry {
        if now < session_start {
            return 1.0;
        }
        if now > session_end {
            return 0.0000001;
        }
        let remaining_ms = session_end.signed_duration_since(now).num_milliseconds() as f64;
        return remaining_ms / FULL_TRADING_DAY_MS;
    }

    // Day-count convention: whole hours between the two midnights, plus one
    // while today's session has not yet closed.
    let span = expiry.signed_duration_since(today).num_hours() as f64;

    if today < expiry && now <= session_end {
        return (span + 1.0).ceil();
    }

    span.ceil()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn cdf_is_symmetric_and_bounded() {
        assert!((norm_cdf(0.0) - 0.5).abs() < 1e-9);
        assert!((norm_cdf(1.0) + norm_cdf(-1.0) - 1.0).abs() < 1e-7);
        assert!(norm_cdf(9.0) > 0.999999);
        assert!(norm_cdf(-9.0) < 0.000001);
    }

    #[test]
    fn vanishing_vol_collapses_to_discounted_intrinsic() {
        let b76 = Black76 { interest_rate: 0.05 };
        let g = b76.greeks(OptionType::Call, 110.0, 100.0, 1.0, 1e-5);
        let expected = (-0.05f64).exp() * 10.0;
        assert!((g.value - expected).abs() < 1e-4);

        let otm = b76.greeks(OptionType::Call, 90.0, 100.0, 1.0, 1e-5);
        assert!(otm.value.abs() < 1e-6);
    }

    #[test]
    fn vanishing_maturity_collapses_to_intrinsic() {
        let b76 = Black76 { interest_rate: 0.05 };
        let call = b76.greeks(OptionType::Call, 110.0, 100.0, 1e-9, 0.2);
        assert!((call.value - 10.0).abs() < 1e-4);

        let put = b76.greeks(OptionType::Put, 90.0, 100.0, 1e-9, 0.2);
        assert!((put.value - 10.0).abs() < 1e-4);
    }

    #[test]
    fn implied_vol_recovers_the_input() {
        let b76 = Black76 { interest_rate: 0.05 };
        for &vol in &[0.1, 0.25, 0.6] {
            let price = b76.greeks(OptionType::Call, 100.0, 100.0, 0.5, vol).value;
            let iv = b76.implied_vol_bisection(OptionType::Call, 100.0, 100.0, 0.5, price);
            assert!(
                (iv - vol).abs() < 1e-3,
                "vol {vol}: recovered {iv}"
            );
        }
    }

    #[test]
    fn expiry_day_clock() {
        let day = date(2024, 10, 17);
        let before_open = day.and_hms_opt(8, 0, 0).unwrap();
        assert_eq!(time_to_expiry_days(day, day, before_open), 1.0);

        let after_close = day.and_hms_opt(16, 0, 0).unwrap();
        assert_eq!(time_to_expiry_days(day, day, after_close), 0.0000001);

        // 12:22:30 is exactly halfway through the 09:15-15:30 session.
        let midway = day.and_hms_opt(12, 22, 30).unwrap();
        assert!((time_to_expiry_days(day, day, midway) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn multi_day_clock_counts_session_hours() {
        let today = date(2024, 10, 10);
        let expiry = date(2024, 10, 17);

        let after_close = today.and_hms_opt(16, 0, 0).unwrap();
        assert_eq!(time_to_expiry_days(expiry, today, after_close), 168.0);

        let during_session = today.and_hms_opt(10, 0, 0).unwrap();
        assert_eq!(time_to_expiry_days(expiry, today, during_session), 169.0);
    }

    #[test]
    fn greeks_match_weekly_nifty_chain() {
        let today = date(2024, 10, 10);
        let expiry = date(2024, 10, 17);
        let now = today.and_hms_opt(16, 0, 0).unwrap();
        let t = time_to_expiry_days(expiry, today, now) / 365.0;

        let strike = 25050.0;
        let ce_ltp = 168.0;
        let pe_ltp = 178.45;
        let synthetic = strike + ce_ltp - pe_ltp;

        let b76 = Black76 { interest_rate: 0.0 };
        let iv = b76.implied_vol_bisection(OptionType::Call, synthetic, strike, t, ce_ltp);
        assert!(iv > 0.0);

        let g = b76.greeks(OptionType::Call, synthetic, strike, t, iv);
        let pe_delta = g.delta - 1.0;

        assert!((g.delta - 0.49).abs() < 0.005, "ce delta {}", g.delta);
        assert!((pe_delta + 0.51).abs() < 0.005, "pe delta {pe_delta}");
        assert!(g.gamma.abs() < 0.005, "gamma {}", g.gamma);
        assert!((g.vega - 67.76).abs() < 0.05, "vega {}", g.vega);
        assert!((g.theta + 0.52).abs() < 0.01, "theta {}", g.theta);
    }
}
