use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Hardware model codes, keyed either by the `0x8050` RDBI hardware id or by
/// the PNF Final record's model byte. Shearwater's own lineup; the exact
/// numeric table comes from the values named in the format glossary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Model {
    Predator,
    Petrel,
    Petrel2,
    Nerd,
    Nerd2,
    Perdix,
    PerdixAi,
    Teric,
    Peregrine,
    PeregrineTx,
    Tern,
    Unknown(u16),
}

impl Model {
    pub fn from_hardware_code(code: u16) -> Self {
        match code {
            0x0101 => Model::Predator,
            0x0404 | 0x0909 => Model::Petrel,
            0x0A0A => Model::Petrel2,
            0x0B0B => Model::Nerd,
            0x0D0D => Model::Nerd2,
            0x0E0E => Model::Perdix,
            0x0C0C => Model::PerdixAi,
            0x0F0F => Model::Teric,
            0x1512 => Model::Peregrine,
            0x1513 => Model::PeregrineTx,
            0x1011 => Model::Tern,
            other => Model::Unknown(other),
        }
    }

    /// The PNF Final record's model byte is a single byte, not the two-byte
    /// hardware id; Teric is the only value the parser cares about directly
    /// (it gates the timezone-offset field), but we keep the full mapping so
    /// `read_device_info` and the parser agree on model names.
    pub fn from_final_byte(byte: u8) -> Self {
        match byte {
            8 => Model::Teric,
            _ => Self::from_hardware_code(byte as u16),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Model::Predator => "Predator".to_string(),
            Model::Petrel => "Petrel".to_string(),
            Model::Petrel2 => "Petrel 2".to_string(),
            Model::Nerd => "NERD".to_string(),
            Model::Nerd2 => "NERD 2".to_string(),
            Model::Perdix => "Perdix".to_string(),
            Model::PerdixAi => "Perdix AI".to_string(),
            Model::Teric => "Teric".to_string(),
            Model::Peregrine => "Peregrine".to_string(),
            Model::PeregrineTx => "Peregrine TX".to_string(),
            Model::Tern => "Tern".to_string(),
            Model::Unknown(code) => format!("Unknown (0x{code:04X})"),
        }
    }
}

/// Dive computer operating mode, decoded from Opening4[1].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiveMode {
    Ccr,
    OcTec,
    Gauge,
    Ppo2,
    SemiClosed,
    OcRec,
    Freedive,
    Avelo,
    Unknown,
}

impl DiveMode {
    pub fn from_opening4_byte(b: u8) -> Self {
        match b {
            0 | 5 => DiveMode::Ccr,
            1 => DiveMode::OcTec,
            2 => DiveMode::Gauge,
            3 => DiveMode::Ppo2,
            4 => DiveMode::SemiClosed,
            6 => DiveMode::OcRec,
            7 => DiveMode::Freedive,
            12 => DiveMode::Avelo,
            _ => DiveMode::Unknown,
        }
    }

    fn is_closed_circuit(&self) -> bool {
        matches!(self, DiveMode::Ccr | DiveMode::SemiClosed)
    }
}

/// A single gas mix slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GasMix {
    pub o2: f64,
    pub he: f64,
    pub is_diluent: bool,
}

/// A deco model name, decoded from Opening2[18].
pub fn deco_model_name(byte: u8) -> String {
    match byte {
        0 => "Buhlmann ZHL-16C".to_string(),
        1 => "VPM-B".to_string(),
        2 => "VPM-B/GFS".to_string(),
        3 => "DCIEM".to_string(),
        n => format!("Unknown ({n})"),
    }
}

/// Tank usage classification. Shearwater's PNF carries only the serial
/// number; usage enrichment is left to callers, so `Unknown` is the only
/// variant the parser ever emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TankUsage {
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tank {
    pub name: String,
    pub serial: String,
    pub usage: TankUsage,
}

/// A dive-event sum type, tagged by variant so JSON consumers can match on
/// `kind` without guessing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum DiveEvent {
    GasChange(GasMix),
    DiluentChange(GasMix),
    Warning(String),
    Error(String),
    Unknown(u8),
}

/// A single dive sample point, decoded from one `0x01` record block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub t_offset_s: u32,
    pub depth_m: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tank_pressure_bar: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ppo2: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setpoint: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cns: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ndl_s: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deco_ceiling_m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deco_stop_depth_m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deco_stop_time_s: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_s: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_mix: Option<GasMix>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensors: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_external_ppo2: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<DiveEvent>,
    pub dive_mode: DiveMode,
}

/// A fully parsed dive, the PNF parser's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedDive {
    #[serde(with = "datetime_format")]
    pub start_time: NaiveDateTime,
    pub duration_s: u32,
    pub max_depth_m: f64,
    pub avg_depth_m: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub surface_pressure_bar: Option<f64>,
    pub samples: Vec<Sample>,
    pub gas_mixes: Vec<GasMix>,
    pub tanks: Vec<Tank>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deco_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gf_low: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gf_high: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dive_mode: Option<DiveMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub water_density: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone_offset_seconds: Option<i32>,
    #[serde(with = "fingerprint_format")]
    pub fingerprint: [u8; 4],
}

/// A dive that failed to parse but is still recorded so `downloadDives`
/// never silently drops a block of bytes it actually received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StubDive {
    #[serde(with = "fingerprint_format")]
    pub fingerprint: [u8; 4],
    pub raw_data: Vec<u8>,
    pub error: String,
}

/// One manifest entry produced by the manifest reader.
#[derive(Debug, Clone, Serialize)]
pub struct DiveLogCandidate {
    pub ordinal: u32,
    #[serde(with = "fingerprint_format")]
    pub fingerprint: [u8; 4],
    pub absolute_address: u32,
}

/// Device info returned by `read_device_info`.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub serial: String,
    pub firmware: String,
    pub model: Model,
    pub model_name: String,
}

/// A downloaded dive log, either fully parsed or a stub on parse failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum DownloadedLog {
    Parsed(ParsedDive),
    Stub(StubDive),
}

/// Progress reported during `download_dives`.
#[derive(Debug, Clone, Copy)]
pub struct DownloadProgress {
    pub current_log_index: u32,
    pub total_logs: u32,
    pub current_log_bytes: usize,
}

mod datetime_format {
    use chrono::NaiveDateTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

    pub fn serialize<S>(date: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&date.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom)
    }
}

mod fingerprint_format {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(fp: &[u8; 4], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let hex: String = fp.iter().map(|b| format!("{b:02X}")).collect();
        serializer.serialize_str(&hex)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 4], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.len() != 8 {
            return Err(serde::de::Error::custom(format!("expected 8 hex chars, got {}", s.len())));
        }
        let mut fp = [0u8; 4];
        for i in 0..4 {
            fp[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(serde::de::Error::custom)?;
        }
        Ok(fp)
    }
}

/// Assemble the gas mix list for a dive from the raw percent arrays and the
/// enabled-slot bitmask.
pub fn assemble_gas_mixes(
    o2_percent: &[u8; 10],
    he_percent: &[u8; 10],
    gases_enabled: u16,
    dive_mode: DiveMode,
) -> Vec<GasMix> {
    let mut mixes = Vec::new();
    for i in 0..10usize {
        if gases_enabled & (1 << i) == 0 {
            continue;
        }
        let is_diluent = i >= 5;
        if is_diluent && !dive_mode.is_closed_circuit() {
            continue;
        }
        if o2_percent[i] == 0 && he_percent[i] == 0 {
            continue;
        }
        mixes.push(GasMix {
            o2: o2_percent[i] as f64 / 100.0,
            he: he_percent[i] as f64 / 100.0,
            is_diluent,
        });
    }
    mixes
}
