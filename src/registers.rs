//! Register map of the supported fuel-gauge families.
//!
//! The MAX1730x exposes a 9-bit register space split across two I2C targets:
//! 0x000-0x0FF at [`PRIMARY_TARGET`] and 0x100-0x1FF at [`SECONDARY_TARGET`].
//! On the wire only the low 8 bits of the address are sent.

use crate::errors::{ConfigError, ConfigResult};
use std::str::FromStr;

/// 7-bit target address for registers 0x000-0x0FF
pub const PRIMARY_TARGET: u8 = 0x36;
/// 7-bit target address for registers 0x100-0x1FF (SBS and non-volatile)
pub const SECONDARY_TARGET: u8 = 0x0B;

/// Registers per page; also the largest block read the loop issues
pub const PAGE_WORDS: usize = 16;

type Page = (u16, [Option<&'static str>; PAGE_WORDS]);

const MAX1730X_PAGES: &[Page] = &[
    (0x000, [
        Some("Status"), Some("VAlrtTh"), Some("TAlrtTh"), Some("SAlrtTh"),
        Some("AtRate"), Some("RepCap"), Some("RepSOC"), Some("Age"),
        Some("MaxMinVolt"), Some("MaxMinTemp"), Some("MaxMinCurr"), Some("Config"),
        Some("QResidual"), Some("MixSOC"), Some("AvSOC"), Some("MiscCfg"),
    ]),
    (0x010, [
        Some("FullCapRep"), Some("TTE"), Some("VCellRep"), Some("FullSocThr"),
        Some("RSlow"), Some("RFast"), Some("AvgTA"), Some("Cycles"),
        Some("DesignCap"), Some("AvgVCell"), Some("VCell"), Some("Temp"),
        Some("Current"), Some("AvgCurrent"), Some("IChgTerm"), Some("AvCap"),
    ]),
    (0x020, [
        Some("TTF"), Some("DevName"), Some("CurrRep"), Some("FullCapNom"),
        None, None, None, Some("AIN0"),
        Some("ChargingCurrent"), Some("FilterCfg"), Some("ChargingVoltage"), Some("MixCap"),
        None, None, None, None,
    ]),
    (0x030, [
        None, None, Some("QRTable20"), None,
        Some("DieTemp"), Some("FullCap"), Some("IAvgEmpty"), None,
        None, Some("FStat2"), Some("VEmpty"), None,
        None, Some("FStat"), Some("Timer"), Some("Vrelax"),
    ]),
    (0x040, [
        Some("AvgDieTemp"), None, Some("QRTable30"), None,
        None, Some("dQAcc"), Some("dPAcc"), None,
        None, Some("ProtTmrStat"), Some("VFRemCap"), None,
        None, Some("QH"), None, None,
    ]),
    (0x0A0, [
        Some("RelaxCfg"), Some("LearnCfg"), None, None,
        Some("MaxPeakPower"), Some("SusPeakPower"), Some("PackResistance"), Some("SysResistance"),
        Some("MinSysVoltage"), Some("MPPCurrent"), Some("SPPCurrent"), Some("Config2"),
        Some("IAlrtTh"), Some("MinVolt"), Some("MinCurr"), None,
    ]),
    (0x0B0, [
        Some("Status2"), Some("Power"), Some("VRipple"), Some("AvgPower"),
        Some("ReturnPatch"), Some("TTFCfg"), Some("CVMixCap"), Some("CVHalfTime"),
        Some("CGTempCo"), Some("AgeForecast"), None, Some("FOTPStat"),
        None, None, Some("TimerH"), None,
    ]),
    (0x0D0, [
        Some("SOCHold"), None, None, None,
        Some("AvgCell1"), None, None, Some("Status"),
        Some("CELL1"), Some("ProtStatus"), None, Some("ModelCfg"),
        Some("AtQResidual"), Some("AtTTE"), Some("AtAvSOC"), Some("AtAvCap"),
    ]),
    (0x0F0, [
        None, None, None, None,
        None, Some("HConfig2"), None, None,
        None, None, None, Some("VFOCV"),
        None, None, None, Some("VFSOC"),
    ]),
    (0x180, [
        Some("nCAPTable0"), Some("nCAPTable1"), Some("nCAPTable2"), Some("nCAPTable3"),
        Some("nCAPTable4"), Some("nCAPTable5"), Some("nCAPTable6"), Some("nCAPTable7"),
        Some("nCAPTable8"), Some("nCAPTable9"), Some("nCAPTable10"), Some("nCAPTable11"),
        Some("nVAlrtTh"), Some("nTAlrtTh"), Some("nIAlrtTh"), Some("nSAlrtTh"),
    ]),
    (0x190, [
        Some("nOCVTable0"), Some("nOCVTable1"), Some("nOCVTable2"), Some("nOCVTable3"),
        Some("nOCVTable4"), Some("nOCVTable5"), Some("nOCVTable6"), Some("nOCVTable7"),
        Some("nOCVTable8"), Some("nOCVTable9"), Some("nOCVTable10"), Some("nOCVTable11"),
        Some("nIChgTerm"), Some("nFilterCfg"), Some("nVEmpty"), Some("nLearnCfg"),
    ]),
    (0x1A0, [
        Some("nQRTable00"), Some("nQRTable10"), Some("nQRTable20"), Some("nQRTable30"),
        Some("nCycles"), Some("nFullCapNom"), Some("nRComp0"), Some("nTempCo"),
        Some("nBattStatus"), Some("nFullCapRep"), Some("nVoltTemp"), Some("nMaxMinCurr"),
        Some("nMaxMinVolt"), Some("nMaxMinTemp"), Some("nFullCapFltr"), Some("nTimerH"),
    ]),
    (0x1B0, [
        Some("nCONFIG"), Some("nRippleCfg"), Some("nMiscCFG"), Some("nDesignCap"),
        Some("nSBSCFG"), Some("nPACKCFG"), Some("nRelaxCFG"), Some("nConvgCFG"),
        Some("nNVCFG0"), Some("nNVCFG1"), Some("nNVCFG2"), Some("nHibCFG"),
        Some("nROMID0"), Some("nROMID1"), Some("nROMID2"), Some("nROMID3"),
    ]),
    (0x1C0, [
        None, None, None, None,
        Some("nRGain"), Some("nPackResistance"), Some("nFullSOCThr"), Some("nTTFCFG"),
        Some("nCGAIN"), Some("nTCurve"), Some("nThermcfg"), Some("nTOFF"),
        Some("nManfctrName"), Some("nManfctrName1"), Some("nManfctrName2"), Some("nRSense"),
    ]),
    (0x1D0, [
        Some("nVPrtTh1"), Some("nTPrtTh1"), Some("nTPrtTh3"), Some("nIPrtTh1"),
        Some("nVPrtTh2"), Some("nTPrtTh2"), Some("nProtMiscTh"), Some("nProtCfg"),
        Some("nJEITAC"), Some("nJEITAV"), Some("nJEITACfg"), Some("nStepChg"),
        Some("nDelayCfg"), Some("nODSCTh"), Some("nODSCCfg"), Some("nCheckSum"),
    ]),
    (0x1E0, [
        Some("nDPLimit"), Some("nScOcvLim"), Some("nAgeFcCfg"), Some("nDesignVoltage"),
        Some("nPackCfg2"), Some("nRFastVShdn"), Some("nManfctrDate"), Some("nFirstUsed"),
        Some("nSerialNumber0"), Some("nSerialNumber1"), Some("nSerialNumber2"), Some("nDeviceName0"),
        Some("nDeviceName1"), Some("nDeviceName2"), Some("nDeviceName3"), Some("nDeviceName4"),
    ]),
];

// Word-sized SBS registers. The block-sized ones (sSerialNumber 0x11C,
// sManfctName 0x120, sDeviceName 0x121, sDevChemistry 0x122, sManfctData 0x123)
// do not fit a 16-bit column and are left out.
const MAX1730X_SBS_WORDS: &[(u16, &str)] = &[
    (0x100, "sManfctAccess"),
    (0x101, "sRemCapAlarm"),
    (0x102, "sRemTimeAlarm"),
    (0x103, "sBatteryMode"),
    (0x104, "sAtRate"),
    (0x106, "sAtTTE"),
    (0x107, "sAtRateOK"),
    (0x108, "sTemperature"),
    (0x109, "sPackVoltage"),
    (0x10A, "sCurrent"),
    (0x10B, "sAvgCurrent"),
    (0x10C, "sMaxError"),
    (0x10D, "sRelSOC"),
    (0x10E, "sAbsSOC"),
    (0x10F, "sRemCap"),
    (0x110, "sFullCap"),
    (0x111, "sRunTTE"),
    (0x112, "sAvgTTE"),
    (0x113, "sAvgTTF"),
    (0x114, "sChargingCurrent"),
    (0x115, "sChargingVoltage"),
    (0x116, "sBatteryStatus"),
    (0x117, "sCycles"),
    (0x118, "sDesignCap"),
    (0x119, "sDesignVolt"),
    (0x11A, "sSpecInfo"),
    (0x11B, "sManfctDate"),
    (0x134, "sTemp1"),
    (0x135, "sIntTemp"),
    (0x136, "sFirstUsed"),
    (0x137, "sAvgTemp1"),
    (0x138, "sAvgIntTemp"),
    (0x13F, "sCell1"),
    (0x14F, "sAvgCell1"),
    (0x167, "sAvCap"),
    (0x168, "sMixCap"),
];

/// Supported device families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    Max1730x,
}

impl FromStr for DeviceFamily {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().as_str() {
            "max1730x" | "max17300" | "max17301" | "max17302" | "max17303" => {
                Ok(DeviceFamily::Max1730x)
            }
            _ => Err(ConfigError::UnsupportedDevice {
                family: s.to_string(),
            }),
        }
    }
}

/// One column of the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterEntry {
    pub address: u16,
    pub name: String,
}

impl RegisterEntry {
    pub fn new(address: u16, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
        }
    }

    /// 7-bit I2C target this register lives behind
    pub fn target(&self) -> u8 {
        if self.address & 0x100 != 0 {
            SECONDARY_TARGET
        } else {
            PRIMARY_TARGET
        }
    }

    /// Register index as sent on the wire
    pub fn register(&self) -> u8 {
        (self.address & 0xFF) as u8
    }

    /// Names repeat across the map (e.g. `Status`), so the address is appended
    pub fn column_name(&self) -> String {
        format!("{}_{:03X}", self.name, self.address)
    }

    // SBS space only answers word accesses
    fn block_readable(&self) -> bool {
        !(0x100..0x180).contains(&self.address)
    }
}

/// Consecutive map entries that can be fetched with one block read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterRun {
    /// Index of the first entry in the map
    pub first: usize,
    /// Number of map entries covered
    pub len: usize,
    pub target: u8,
    /// Wire register of the first word read
    pub register: u8,
    /// Words to read, including reserved gaps between entries
    pub words: usize,
}

/// Ordered register list read on every sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMap {
    entries: Vec<RegisterEntry>,
}

impl RegisterMap {
    pub fn new(entries: Vec<RegisterEntry>) -> Self {
        Self { entries }
    }

    pub fn for_family(family: DeviceFamily, include_reserved: bool) -> Self {
        match family {
            DeviceFamily::Max1730x => Self::max1730x(include_reserved),
        }
    }

    fn max1730x(include_reserved: bool) -> Self {
        let mut entries = Vec::new();
        for (base, names) in MAX1730X_PAGES {
            for (offset, name) in names.iter().enumerate() {
                let address = base + offset as u16;
                match name {
                    Some(name) => entries.push(RegisterEntry::new(address, *name)),
                    None if include_reserved => entries.push(RegisterEntry::new(address, "RSVD")),
                    None => {}
                }
            }
        }
        for (address, name) in MAX1730X_SBS_WORDS {
            entries.push(RegisterEntry::new(*address, *name));
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[RegisterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.entries.iter().map(RegisterEntry::column_name).collect()
    }

    /// Group the map into block-read runs of at most `max_words` words.
    ///
    /// A run never crosses a target or a 16-register page, and entries that
    /// must be read individually always form a run of their own.
    pub fn runs(&self, max_words: usize) -> Vec<RegisterRun> {
        let max_words = max_words.clamp(1, PAGE_WORDS);
        let mut runs: Vec<RegisterRun> = Vec::new();

        for (index, entry) in self.entries.iter().enumerate() {
            if let Some(run) = runs.last_mut() {
                let prev = &self.entries[index - 1];
                let span = usize::from(entry.register().wrapping_sub(run.register)) + 1;
                let joins = entry.block_readable()
                    && prev.block_readable()
                    && entry.target() == run.target
                    && entry.address > prev.address
                    && entry.address >> 4 == prev.address >> 4
                    && span <= max_words;
                if joins {
                    run.len += 1;
                    run.words = span;
                    continue;
                }
            }
            runs.push(RegisterRun {
                first: index,
                len: 1,
                target: entry.target(),
                register: entry.register(),
                words: 1,
            });
        }
        runs
    }

    /// Word offset of `entry_index` inside `run`
    pub fn offset_in_run(&self, run: &RegisterRun, entry_index: usize) -> usize {
        usize::from(self.entries[entry_index].register().wrapping_sub(run.register))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max1730x_map_skips_reserved_by_default() {
        let map = RegisterMap::for_family(DeviceFamily::Max1730x, false);
        assert!(map.entries().iter().all(|e| e.name != "RSVD"));
        assert_eq!(map.entries()[0].column_name(), "Status_000");
        assert_eq!(map.entries().last().map(|e| e.address), Some(0x168));
    }

    #[test]
    fn reserved_slots_become_rsvd_columns() {
        let plain = RegisterMap::for_family(DeviceFamily::Max1730x, false);
        let full = RegisterMap::for_family(DeviceFamily::Max1730x, true);
        assert_eq!(full.len(), MAX1730X_PAGES.len() * PAGE_WORDS + MAX1730X_SBS_WORDS.len());
        assert!(full.len() > plain.len());
        assert!(full.column_names().contains(&"RSVD_024".to_string()));
    }

    #[test]
    fn targets_follow_the_address_space_split() {
        let low = RegisterEntry::new(0x0D7, "Status");
        let high = RegisterEntry::new(0x1B3, "nDesignCap");
        assert_eq!((low.target(), low.register()), (PRIMARY_TARGET, 0xD7));
        assert_eq!((high.target(), high.register()), (SECONDARY_TARGET, 0xB3));
    }

    #[test]
    fn runs_stay_inside_a_page() {
        let map = RegisterMap::for_family(DeviceFamily::Max1730x, false);
        let runs = map.runs(PAGE_WORDS);

        let covered: usize = runs.iter().map(|r| r.len).sum();
        assert_eq!(covered, map.len());

        let first = runs[0];
        assert_eq!((first.first, first.len, first.words), (0, 16, 16));

        // 0x020 page: TTF..FullCapNom, AIN0.., gap at 0x024-0x026
        let page_020 = runs.iter().find(|r| r.target == PRIMARY_TARGET && r.register == 0x20).unwrap();
        assert_eq!(page_020.len, 9);
        assert_eq!(page_020.words, 12);
        assert_eq!(map.offset_in_run(page_020, page_020.first + 4), 7);
    }

    #[test]
    fn sbs_registers_are_single_word_runs() {
        let map = RegisterMap::for_family(DeviceFamily::Max1730x, false);
        let sbs_runs: Vec<_> = map
            .runs(PAGE_WORDS)
            .into_iter()
            .filter(|r| r.target == SECONDARY_TARGET && r.register < 0x80)
            .collect();
        assert_eq!(sbs_runs.len(), MAX1730X_SBS_WORDS.len());
        assert!(sbs_runs.iter().all(|r| r.len == 1 && r.words == 1));
    }

    #[test]
    fn sbs_block_registers_are_not_logged() {
        let map = RegisterMap::for_family(DeviceFamily::Max1730x, true);
        for address in [0x11C, 0x120, 0x121, 0x122, 0x123] {
            assert!(
                map.entries().iter().all(|e| e.address != address),
                "0x{:03x} is in the map",
                address
            );
        }
    }

    #[test]
    fn unknown_family_is_a_config_error() {
        assert!("max17201".parse::<DeviceFamily>().is_err());
        assert_eq!("MAX1730x".parse::<DeviceFamily>().unwrap(), DeviceFamily::Max1730x);
    }
}
