//! Built-in stage types
//!
//! Small building blocks for composing inspection chains:
//!
//! | Name | Kind | Behaviour |
//! |------|------|-----------|
//! | `echo` | pass | Forwards untouched |
//! | `timestamp` | transform | Stamps arrival time if missing |
//! | `min_len` | filter | Drops payloads shorter than `min_len` |
//! | `normalize` | transform | Lowercases ASCII payload bytes |
//! | `regex` | offload | Scans every packet on the accelerator |
//! | `jitter` | pass | Busy-waits a random 0..`max_delay_us` |

use crate::buffer::Packet;
use crate::error::{PipelineError, Result};
use crate::stage::{Dataplane, Stage, StageContext, StageRegistry, Verdict};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

/// Register every built-in stage type
pub fn register_builtins(registry: &mut StageRegistry) {
    registry.register("echo", || Box::new(EchoStage));
    registry.register("timestamp", || Box::new(TimestampStage));
    registry.register("min_len", || Box::new(MinLenStage::default()));
    registry.register("normalize", || Box::new(NormalizeStage));
    registry.register("regex", || Box::new(RegexStage));
    registry.register("jitter", || Box::new(JitterStage::default()));
}

/// Pass-through
pub struct EchoStage;

impl Stage for EchoStage {
    fn name(&self) -> &'static str {
        "echo"
    }

    #[inline]
    fn process(&mut self, _pkt: &mut Packet, _dp: &mut Dataplane) -> Result<Verdict> {
        Ok(Verdict::Forward)
    }
}

/// Restarts the latency clock: egress latency is then measured from the
/// burst in which this stage saw the packet
pub struct TimestampStage;

impl Stage for TimestampStage {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    #[inline]
    fn process(&mut self, pkt: &mut Packet, dp: &mut Dataplane) -> Result<Verdict> {
        let now = dp.now();
        Ok(dp.transform(pkt, |p| p.stamp_rx(now)))
    }
}

/// Length filter
#[derive(Default)]
pub struct MinLenStage {
    min_len: usize,
}

impl Stage for MinLenStage {
    fn name(&self) -> &'static str {
        "min_len"
    }

    fn init(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        self.min_len = ctx.param_u64("min_len", 0)? as usize;
        Ok(())
    }

    #[inline]
    fn process(&mut self, pkt: &mut Packet, dp: &mut Dataplane) -> Result<Verdict> {
        let min_len = self.min_len;
        Ok(dp.filter(pkt, |p| p.len() < min_len))
    }
}

/// ASCII lowercasing ahead of case-sensitive matching
pub struct NormalizeStage;

impl Stage for NormalizeStage {
    fn name(&self) -> &'static str {
        "normalize"
    }

    #[inline]
    fn process(&mut self, pkt: &mut Packet, dp: &mut Dataplane) -> Result<Verdict> {
        Ok(dp.transform(pkt, |p| p.data_mut().make_ascii_lowercase()))
    }
}

/// Accelerator offload
pub struct RegexStage;

impl Stage for RegexStage {
    fn name(&self) -> &'static str {
        "regex"
    }

    fn init(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        if !ctx.accelerated {
            return Err(PipelineError::stage(
                "regex",
                format!("layer {} instance {} has no accelerator configured", ctx.layer, ctx.index),
            ));
        }
        Ok(())
    }

    #[inline]
    fn process(&mut self, _pkt: &mut Packet, dp: &mut Dataplane) -> Result<Verdict> {
        dp.offload()
    }
}

/// Random per-packet delay
pub struct JitterStage {
    max_delay: Duration,
    rng: StdRng,
}

impl Default for JitterStage {
    fn default() -> Self {
        Self {
            max_delay: Duration::from_micros(20),
            rng: StdRng::from_entropy(),
        }
    }
}

impl Stage for JitterStage {
    fn name(&self) -> &'static str {
        "jitter"
    }

    fn init(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        let us = ctx.param_u64("max_delay_us", self.max_delay.as_micros() as u64)?;
        self.max_delay = Duration::from_micros(us);
        self.rng = StdRng::seed_from_u64(ctx.worker_id as u64 ^ 0x5eed);
        Ok(())
    }

    fn process(&mut self, _pkt: &mut Packet, _dp: &mut Dataplane) -> Result<Verdict> {
        let max = self.max_delay.as_nanos() as u64;
        if max > 0 {
            let deadline = Instant::now() + Duration::from_nanos(self.rng.gen_range(0..=max));
            while Instant::now() < deadline {
                std::hint::spin_loop();
            }
        }
        Ok(Verdict::Forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageParams;

    fn ctx(params: &StageParams, accelerated: bool) -> StageContext<'_> {
        StageContext {
            layer: 0,
            index: 1,
            worker_id: 1,
            batch_size: 64,
            accelerated,
            params,
        }
    }

    #[test]
    fn test_min_len_filter() {
        let mut params = StageParams::new();
        params.insert("min_len".into(), 8.into());
        let mut stage = MinLenStage::default();
        stage.init(&ctx(&params, false)).unwrap();

        let mut dp = Dataplane::new(1, false);
        let mut short = Packet::new(b"tiny");
        let mut long = Packet::new(b"long enough");
        assert_eq!(stage.process(&mut short, &mut dp).unwrap(), Verdict::Drop);
        assert_eq!(stage.process(&mut long, &mut dp).unwrap(), Verdict::Forward);
    }

    #[test]
    fn test_normalize() {
        let mut dp = Dataplane::new(0, false);
        let mut pkt = Packet::new(b"GET /Admin");
        NormalizeStage.process(&mut pkt, &mut dp).unwrap();
        assert_eq!(pkt.data(), b"get /admin");
    }

    #[test]
    fn test_timestamp_restarts_clock() {
        let mut dp = Dataplane::new(0, false);
        let earlier = Instant::now();
        let mut stamped = Packet::new(b"a");
        stamped.stamp_rx(earlier);
        let mut fresh = Packet::new(b"b");

        std::thread::sleep(Duration::from_millis(2));
        dp.begin_burst();
        TimestampStage.process(&mut stamped, &mut dp).unwrap();
        TimestampStage.process(&mut fresh, &mut dp).unwrap();
        assert_eq!(stamped.rx_timestamp(), Some(dp.now()));
        assert!(dp.now() > earlier);
        assert_eq!(fresh.rx_timestamp(), Some(dp.now()));
    }

    #[test]
    fn test_regex_requires_accelerator() {
        let params = StageParams::new();
        assert!(RegexStage.init(&ctx(&params, false)).is_err());
        assert!(RegexStage.init(&ctx(&params, true)).is_ok());

        let mut dp = Dataplane::new(1, true);
        let mut pkt = Packet::new(b"x");
        assert_eq!(RegexStage.process(&mut pkt, &mut dp).unwrap(), Verdict::Offload);
    }

    #[test]
    fn test_jitter_bounded() {
        let mut params = StageParams::new();
        params.insert("max_delay_us".into(), 50.into());
        let mut stage = JitterStage::default();
        stage.init(&ctx(&params, false)).unwrap();

        let mut dp = Dataplane::new(0, false);
        let mut pkt = Packet::new(b"x");
        let started = Instant::now();
        for _ in 0..10 {
            assert_eq!(stage.process(&mut pkt, &mut dp).unwrap(), Verdict::Forward);
        }
        assert!(started.elapsed() <= Duration::from_secs(1));
        assert_eq!(stage.max_delay, Duration::from_micros(50));
    }
}
