// Copyright (C) 2020  Nexminer contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! BTC08 backend configuration: TOML file parsing plus the command line
//! surface, resolved once at startup into an immutable per-chain settings
//! value that the chain constructors receive by reference.

use crate::chip::{MAX_CHIPS_PER_CHAIN, MAX_CORES_PER_CHIP};
use crate::error::{self, ErrorKind};
use crate::power::{self, VoltageBand};
use crate::spi;

use serde::{Deserialize, Serialize};

use std::fs;
use std::time::Duration;

/// Expected configuration version
const FORMAT_VERSION: &str = "beta";

/// Expected configuration model
const FORMAT_MODEL: &str = "BTC08";

/// Location of default config
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nexminer.toml";

/// Default PLL frequency for clocking the chips in MHz
pub const DEFAULT_PLL_MHZ: u32 = 550;

/// Default UART clock divider programmed via SET_CONTROL
pub const DEFAULT_UDIV: u32 = 16 + 1;

/// Default minimum of live cores per chip (90% of the full complement)
pub const DEFAULT_MIN_CORES: usize = MAX_CORES_PER_CHIP * 9 / 10;

/// Default minimum of chips per chain (90% of a full chain)
pub const DEFAULT_MIN_CHIPS: usize = MAX_CHIPS_PER_CHAIN * 9 / 10;

/// Number of midstates when AsicBoost is enabled
pub const ASIC_BOOST_MIDSTATE_COUNT: usize = 4;

/// AsicBoost is on by default
pub const DEFAULT_ASIC_BOOST: bool = true;

/// Maximum time it takes to compute one job under normal circumstances
pub const JOB_TIMEOUT: Duration = Duration::from_secs(5);

/// Default soak duration of the self-test full-load phase
pub const DEFAULT_FULLTEST_MS: u64 = 2000;

#[derive(Serialize, Deserialize, Clone, Debug)]
struct Format {
    version: String,
    model: String,
}

impl Default for Format {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION.to_string(),
            model: FORMAT_MODEL.to_string(),
        }
    }
}

/// Chain settings overridable from the config file
#[derive(Serialize, Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Chain {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spi_clk_khz: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udiv: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_cores: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_chips: Option<usize>,
}

/// Self-test thresholds. These used to be read back from the firmware
/// environment on the production line; they are ordinary configuration now.
#[derive(Serialize, Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Selftest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_400mv: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_400mv: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_420mv: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_420mv: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_cores: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_chips: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulltest_ms: Option<u64>,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Backend {
    format: Format,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asic_boost: Option<bool>,
    #[serde(rename = "chain")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_global: Option<Chain>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selftest: Option<Selftest>,
}

/// Options taken from the command line; every field beats both the config
/// file and the built-in default.
#[derive(Default, Clone, Debug)]
pub struct CliOptions {
    pub spi_clk_khz: Option<u32>,
    pub pll_mhz: Option<u32>,
    pub udiv: Option<u32>,
    pub min_cores: Option<usize>,
    pub min_chips: Option<usize>,
    pub test_mode: bool,
    pub num_chips: Option<usize>,
    pub num_cores: Option<usize>,
    pub dump_traffic: bool,
}

impl CliOptions {
    /// Parse the `spi_clk_khz:pll_mhz:udiv` triplet; a zero keeps the
    /// default for that position.
    pub fn parse_options_triplet(&mut self, triplet: &str) -> error::Result<()> {
        let mut values = [0u32; 3];
        for (slot, part) in values.iter_mut().zip(triplet.split(':')) {
            *slot = part
                .parse()
                .map_err(|_| ErrorKind::Config(format!("bad options triplet '{}'", triplet)))?;
        }
        let [spi_clk, pll, udiv] = values;
        if spi_clk != 0 {
            self.spi_clk_khz = Some(spi_clk);
        }
        if pll != 0 {
            self.pll_mhz = Some(pll);
        }
        if udiv != 0 {
            self.udiv = Some(udiv);
        }
        Ok(())
    }

    /// Parse the `num_chips:num_cores` test override; zero keeps the default.
    pub fn parse_chips(&mut self, spec: &str) -> error::Result<()> {
        let mut values = [0usize; 2];
        for (slot, part) in values.iter_mut().zip(spec.split(':')) {
            *slot = part
                .parse()
                .map_err(|_| ErrorKind::Config(format!("bad chip spec '{}'", spec)))?;
        }
        let [num_chips, num_cores] = values;
        if num_chips != 0 {
            self.num_chips = Some(num_chips);
        }
        if num_cores != 0 {
            self.num_cores = Some(num_cores);
        }
        Ok(())
    }
}

/// Immutable, fully resolved chain settings
#[derive(Clone, Debug)]
pub struct ResolvedChainConfig {
    pub spi_clk_khz: u32,
    pub pll_mhz: u32,
    pub udiv: u32,
    pub min_cores: usize,
    pub min_chips: usize,
    pub midstate_count: usize,
    pub test_mode: bool,
    /// Cores to leave enabled per chip (drives the BIST disable mask)
    pub enabled_cores: usize,
    /// Expected chip count override for the self-test
    pub expected_chips: usize,
    pub dump_traffic: bool,
}

/// Resolved self-test thresholds
#[derive(Clone, Debug)]
pub struct ResolvedSelftestConfig {
    pub bands: [VoltageBand; 2],
    pub min_cores: usize,
    pub min_chips: usize,
    pub fulltest: Duration,
}

impl Backend {
    pub fn parse(config_path: &str) -> error::Result<Self> {
        let contents = fs::read_to_string(config_path)
            .map_err(|e| ErrorKind::Config(format!("cannot read '{}': {}", config_path, e)))?;
        let backend: Self = toml::from_str(&contents)
            .map_err(|e| ErrorKind::Config(format!("cannot parse '{}': {}", config_path, e)))?;

        if backend.format.model != FORMAT_MODEL {
            Err(ErrorKind::Config(format!(
                "incompatible format model '{}'",
                backend.format.model
            )))?
        }
        if backend.format.version != FORMAT_VERSION {
            Err(ErrorKind::Config(format!(
                "incompatible format version '{}'",
                backend.format.version
            )))?
        }
        Ok(backend)
    }

    pub fn midstate_count(&self) -> usize {
        if self.asic_boost.unwrap_or(DEFAULT_ASIC_BOOST) {
            ASIC_BOOST_MIDSTATE_COUNT
        } else {
            1
        }
    }

    pub fn resolve_chain_config(&self, cli: &CliOptions) -> ResolvedChainConfig {
        let global = self.chain_global.clone().unwrap_or_default();
        ResolvedChainConfig {
            spi_clk_khz: cli
                .spi_clk_khz
                .or(global.spi_clk_khz)
                .unwrap_or(spi::DEFAULT_SPI_CLK_KHZ)
                .max(spi::MIN_SPI_CLK_KHZ),
            pll_mhz: cli.pll_mhz.or(global.frequency).unwrap_or(DEFAULT_PLL_MHZ),
            udiv: cli.udiv.or(global.udiv).unwrap_or(DEFAULT_UDIV),
            min_cores: cli
                .min_cores
                .or(global.min_cores)
                .unwrap_or(DEFAULT_MIN_CORES),
            min_chips: cli
                .min_chips
                .or(global.min_chips)
                .unwrap_or(DEFAULT_MIN_CHIPS),
            midstate_count: self.midstate_count(),
            test_mode: cli.test_mode,
            enabled_cores: cli.num_cores.unwrap_or(MAX_CORES_PER_CHIP),
            expected_chips: cli.num_chips.unwrap_or(MAX_CHIPS_PER_CHAIN),
            dump_traffic: cli.dump_traffic,
        }
    }

    pub fn resolve_selftest_config(&self) -> ResolvedSelftestConfig {
        let selftest = self.selftest.clone().unwrap_or_default();
        let default_band = |mv| VoltageBand::with_default_margin(mv);
        let band_400 = default_band(power::TEST_POINTS_MV[0]);
        let band_420 = default_band(power::TEST_POINTS_MV[1]);
        ResolvedSelftestConfig {
            bands: [
                VoltageBand {
                    nominal_mv: band_400.nominal_mv,
                    min_mv: selftest.min_400mv.unwrap_or(band_400.min_mv),
                    max_mv: selftest.max_400mv.unwrap_or(band_400.max_mv),
                },
                VoltageBand {
                    nominal_mv: band_420.nominal_mv,
                    min_mv: selftest.min_420mv.unwrap_or(band_420.min_mv),
                    max_mv: selftest.max_420mv.unwrap_or(band_420.max_mv),
                },
            ],
            min_cores: selftest.min_cores.unwrap_or(MAX_CORES_PER_CHIP - 10),
            min_chips: selftest.min_chips.unwrap_or(MAX_CHIPS_PER_CHAIN),
            fulltest: Duration::from_millis(selftest.fulltest_ms.unwrap_or(DEFAULT_FULLTEST_MS)),
        }
    }
}
