//! Transport to Diretta targets.
//!
//! The Diretta protocol itself lives in the vendor SDK, which this module
//! treats as a black box that accepts planar byte blocks at a negotiated
//! format. With the `vendor-sdk` cargo feature the SDK is linked via
//! `DIRETTA_SDK_PATH` (see `build.rs`); without it a discard target stands
//! in so the engine runs and tests end to end on machines without the SDK.

use anyhow::{bail, Result};
use std::str::FromStr;

use crate::format::AudioFormat;

/// SDK transfer pacing modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    #[default]
    Auto,
    VarMax,
    VarAuto,
    FixAuto,
    Random,
}

impl FromStr for TransferMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" | "" => Ok(Self::Auto),
            "varmax" => Ok(Self::VarMax),
            "varauto" => Ok(Self::VarAuto),
            "fixauto" => Ok(Self::FixAuto),
            "random" => Ok(Self::Random),
            other => bail!("unknown transfer mode: {other}"),
        }
    }
}

/// Transport knobs forwarded to the SDK session.
#[derive(Debug, Clone)]
pub struct DirettaConfig {
    /// 1-based target index as printed by `--list-targets`.
    pub target_index: usize,
    /// SDK thread priority mode (0 disables the real-time request).
    pub thread_mode: i32,
    /// MTU override in bytes; 0 = use the target-reported value.
    pub mtu: u32,
    /// Cycle time in microseconds when `cycle_auto` is false.
    pub cycle_time_us: u32,
    pub cycle_auto: bool,
    pub transfer_mode: TransferMode,
    /// Info packet cycle in microseconds.
    pub info_cycle_us: u32,
    /// Minimum cycle for the random transfer mode (0 = unused).
    pub cycle_min_time_us: u32,
    /// 0 = self profile, otherwise target profile limit time in microseconds.
    pub target_profile_limit_us: u32,
}

impl Default for DirettaConfig {
    fn default() -> Self {
        Self {
            target_index: 1,
            thread_mode: 1,
            mtu: 0,
            cycle_time_us: 10_000,
            cycle_auto: true,
            transfer_mode: TransferMode::Auto,
            info_cycle_us: 100_000,
            cycle_min_time_us: 0,
            target_profile_limit_us: 200,
        }
    }
}

/// One discovered target.
#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub index: usize,
    pub name: String,
    pub mtu: usize,
}

/// An acquired target session endpoint.
pub trait Target: Send {
    fn name(&self) -> &str;
    /// Link MTU in bytes as reported by the target.
    fn mtu(&self) -> usize;
    /// Negotiate (or renegotiate) the session for `format`.
    fn set_format(&mut self, format: &AudioFormat) -> Result<()>;
    /// Send one packet of planar audio bytes.
    fn send(&mut self, packet: &[u8]) -> Result<()>;
    /// Release the session while keeping the target acquired.
    fn close_session(&mut self);
}

/// Enumerate reachable targets.
pub fn list_targets() -> Result<Vec<TargetInfo>> {
    backend::list_targets()
}

/// Acquire the target at `config.target_index`.
pub fn acquire(config: &DirettaConfig) -> Result<Box<dyn Target>> {
    if config.target_index < 1 {
        bail!("target index must be >= 1");
    }
    backend::acquire(config)
}

#[cfg(feature = "vendor-sdk")]
mod backend {
    use super::*;
    use std::ffi::CStr;
    use std::os::raw::{c_char, c_int, c_uint};

    #[allow(non_camel_case_types)]
    type diretta_handle = *mut std::ffi::c_void;

    extern "C" {
        fn DirettaSyncScan() -> c_int;
        fn DirettaSyncTargetName(index: c_int) -> *const c_char;
        fn DirettaSyncTargetMtu(index: c_int) -> c_uint;
        fn DirettaSyncOpen(index: c_int, thread_mode: c_int) -> diretta_handle;
        fn DirettaSyncConfigure(
            handle: diretta_handle,
            sample_rate: c_uint,
            bits: c_uint,
            channels: c_uint,
            is_dsd: c_int,
            transfer_mode: c_int,
            info_cycle_us: c_uint,
            cycle_min_us: c_uint,
            profile_limit_us: c_uint,
        ) -> c_int;
        fn DirettaSyncSend(handle: diretta_handle, data: *const u8, len: usize) -> c_int;
        fn DirettaSyncCloseSession(handle: diretta_handle);
        fn DirettaSyncRelease(handle: diretta_handle);
    }

    pub fn list_targets() -> Result<Vec<TargetInfo>> {
        let count = unsafe { DirettaSyncScan() };
        if count < 0 {
            bail!("target scan failed ({count})");
        }
        let mut out = Vec::new();
        for i in 0..count {
            let name = unsafe {
                let p = DirettaSyncTargetName(i);
                if p.is_null() {
                    continue;
                }
                CStr::from_ptr(p).to_string_lossy().into_owned()
            };
            let mtu = unsafe { DirettaSyncTargetMtu(i) } as usize;
            out.push(TargetInfo {
                index: i as usize + 1,
                name,
                mtu,
            });
        }
        Ok(out)
    }

    pub fn acquire(config: &DirettaConfig) -> Result<Box<dyn Target>> {
        let targets = list_targets()?;
        let info = targets
            .iter()
            .find(|t| t.index == config.target_index)
            .cloned();
        let Some(info) = info else {
            bail!(
                "target index {} out of range ({} found)",
                config.target_index,
                targets.len()
            );
        };

        let handle =
            unsafe { DirettaSyncOpen(config.target_index as c_int - 1, config.thread_mode) };
        if handle.is_null() {
            bail!("failed to acquire target #{}", config.target_index);
        }
        Ok(Box::new(SdkTarget {
            handle,
            info,
            config: config.clone(),
        }))
    }

    struct SdkTarget {
        handle: diretta_handle,
        info: TargetInfo,
        config: DirettaConfig,
    }

    // Safety: the SDK documents handles as usable from one thread at a time;
    // the sink funnels every call through its worker/control paths.
    unsafe impl Send for SdkTarget {}

    impl Target for SdkTarget {
        fn name(&self) -> &str {
            &self.info.name
        }

        fn mtu(&self) -> usize {
            self.info.mtu
        }

        fn set_format(&mut self, format: &AudioFormat) -> Result<()> {
            let rc = unsafe {
                DirettaSyncConfigure(
                    self.handle,
                    format.sample_rate,
                    format.bit_depth,
                    format.channels,
                    format.is_dsd as c_int,
                    self.config.transfer_mode as c_int,
                    self.config.info_cycle_us,
                    self.config.cycle_min_time_us,
                    self.config.target_profile_limit_us,
                )
            };
            if rc != 0 {
                bail!("target rejected format ({rc})");
            }
            Ok(())
        }

        fn send(&mut self, packet: &[u8]) -> Result<()> {
            let rc = unsafe { DirettaSyncSend(self.handle, packet.as_ptr(), packet.len()) };
            if rc != 0 {
                bail!("target send failed ({rc})");
            }
            Ok(())
        }

        fn close_session(&mut self) {
            unsafe { DirettaSyncCloseSession(self.handle) };
        }
    }

    impl Drop for SdkTarget {
        fn drop(&mut self) {
            unsafe { DirettaSyncRelease(self.handle) };
        }
    }
}

#[cfg(not(feature = "vendor-sdk"))]
mod backend {
    use super::*;

    const DEFAULT_MTU: usize = 1500;

    pub fn list_targets() -> Result<Vec<TargetInfo>> {
        Ok(vec![TargetInfo {
            index: 1,
            name: "discard (built without vendor-sdk)".to_string(),
            mtu: DEFAULT_MTU,
        }])
    }

    pub fn acquire(config: &DirettaConfig) -> Result<Box<dyn Target>> {
        tracing::warn!(
            target_index = config.target_index,
            "built without vendor-sdk; audio will be discarded"
        );
        let mtu = if config.mtu > 0 {
            config.mtu as usize
        } else {
            DEFAULT_MTU
        };
        Ok(Box::new(DiscardTarget {
            name: format!("discard #{}", config.target_index),
            mtu,
        }))
    }

    struct DiscardTarget {
        name: String,
        mtu: usize,
    }

    impl Target for DiscardTarget {
        fn name(&self) -> &str {
            &self.name
        }

        fn mtu(&self) -> usize {
            self.mtu
        }

        fn set_format(&mut self, format: &AudioFormat) -> Result<()> {
            tracing::debug!(?format, "discard target format set");
            Ok(())
        }

        fn send(&mut self, packet: &[u8]) -> Result<()> {
            let _ = packet;
            Ok(())
        }

        fn close_session(&mut self) {}
    }
}
