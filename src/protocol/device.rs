use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::protocol::error::DeviceError;

/// Client flavour presented to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Platform {
    Android = 1,
    APad = 2,
    Watch = 3,
    IMac = 4,
    IPad = 5,
    Tim = 6,
}

impl Platform {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Android),
            2 => Some(Self::APad),
            3 => Some(Self::Watch),
            4 => Some(Self::IMac),
            5 => Some(Self::IPad),
            6 => Some(Self::Tim),
            _ => None,
        }
    }
}

/// Immutable application descriptor for one platform version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Apk {
    pub id: &'static str,
    pub app_key: &'static str,
    pub name: &'static str,
    pub version: &'static str,
    pub ver: &'static str,
    pub sign: [u8; 16],
    pub buildtime: u32,
    pub appid: u32,
    pub subid: u32,
    pub bitmap: u32,
    pub main_sig_map: u32,
    pub sub_sig_map: u32,
    pub sdkver: &'static str,
    pub display: &'static str,
    pub device_type: i32,
    pub qua: &'static str,
    pub ssover: u32,
}

const MOBILE_SIGN: [u8; 16] = [
    0xA6, 0xB7, 0x45, 0xBF, 0x24, 0xA2, 0xC2, 0x77, 0x52, 0x77, 0x16, 0xF6, 0xF3, 0x6E, 0xB6, 0x8D,
];
const HD_SIGN: [u8; 16] = [
    0xAA, 0x39, 0x78, 0xF4, 0x1F, 0xD9, 0x6F, 0xF9, 0x91, 0x4A, 0x66, 0x9E, 0x18, 0x64, 0x74, 0xC7,
];
const TIM_SIGN: [u8; 16] = [
    0x77, 0x5E, 0x69, 0x6D, 0x09, 0x85, 0x68, 0x72, 0xFD, 0xD8, 0xAB, 0x4F, 0x3F, 0x06, 0xB1, 0xE0,
];
const APP_KEY: &str = "0S200MNJT807V3GE";

struct Release {
    name: &'static str,
    version: &'static str,
    ver: &'static str,
    buildtime: u32,
    subid: u32,
    pad_subid: u32,
    bitmap: u32,
    sdkver: &'static str,
    qua: &'static str,
    ssover: u32,
}

const MOBILE_RELEASES: [Release; 3] = [
    Release {
        name: "A8.9.83.c9a61e5e",
        version: "8.9.83.12605",
        ver: "8.9.83",
        buildtime: 1691565978,
        subid: 537178646,
        pad_subid: 537178685,
        bitmap: 150470524,
        sdkver: "6.0.0.2554",
        qua: "V1_AND_SQ_8.9.83_4680_YYB_D",
        ssover: 20,
    },
    Release {
        name: "A8.9.80.57a42f50",
        version: "8.9.80.12440",
        ver: "8.9.80",
        buildtime: 1691565978,
        subid: 537176863,
        pad_subid: 537176902,
        bitmap: 150470524,
        sdkver: "6.0.0.2554",
        qua: "V1_AND_SQ_8.9.80_4614_YYB_D",
        ssover: 20,
    },
    Release {
        name: "A8.9.63.5156de84",
        version: "8.9.63.11390",
        ver: "8.9.63",
        buildtime: 1685069178,
        subid: 537164840,
        pad_subid: 537164888,
        bitmap: 150470524,
        sdkver: "6.0.0.2546",
        qua: "V1_AND_SQ_8.9.63_4194_YYB_D",
        ssover: 20,
    },
];

const TIM_RELEASES: [Release; 2] = [
    Release {
        name: "A3.5.5.fa2ef27c",
        version: "3.5.5.3198",
        ver: "3.5.5",
        buildtime: 1630062176,
        subid: 537177451,
        pad_subid: 0,
        bitmap: 150470524,
        sdkver: "6.0.0.2484",
        qua: "V1_AND_SQ_8.3.9_355_TIM_D",
        ssover: 18,
    },
    Release {
        name: "A3.5.2.3f4af297",
        version: "3.5.2.3178",
        ver: "3.5.2",
        buildtime: 1630062176,
        subid: 537162286,
        pad_subid: 0,
        bitmap: 150470524,
        sdkver: "6.0.0.2484",
        qua: "V1_AND_SQ_8.3.9_352_TIM_D",
        ssover: 18,
    },
];

const WATCH_RELEASES: [Release; 2] = [
    Release {
        name: "A2.1.7",
        version: "2.1.7",
        ver: "2.1.7",
        buildtime: 1654570540,
        subid: 537140974,
        pad_subid: 0,
        bitmap: 16252796,
        sdkver: "6.0.0.2366",
        qua: "V1_WAT_SQ_2.1.7_002_IDC_B",
        ssover: 5,
    },
    Release {
        name: "A2.0.8",
        version: "2.0.8",
        ver: "2.0.8",
        buildtime: 1559564731,
        subid: 537065138,
        pad_subid: 0,
        bitmap: 16252796,
        sdkver: "6.0.0.2365",
        qua: "",
        ssover: 5,
    },
];

fn mobile(release: &Release, display: &'static str, subid: u32) -> Apk {
    Apk {
        id: "com.tencent.mobileqq",
        app_key: APP_KEY,
        name: release.name,
        version: release.version,
        ver: release.ver,
        sign: MOBILE_SIGN,
        buildtime: release.buildtime,
        appid: 16,
        subid,
        bitmap: release.bitmap,
        main_sig_map: 16724722,
        sub_sig_map: 0x10400,
        sdkver: release.sdkver,
        display,
        device_type: 3,
        qua: release.qua,
        ssover: release.ssover,
    }
}

fn tim(release: &Release) -> Apk {
    Apk {
        id: "com.tencent.tim",
        sign: TIM_SIGN,
        display: "Tim",
        device_type: -1,
        ..mobile(release, "Tim", release.subid)
    }
}

fn watch(release: &Release) -> Apk {
    Apk {
        id: "com.tencent.qqlite",
        display: "Watch",
        device_type: 8,
        ..mobile(release, "Watch", release.subid)
    }
}

fn imac() -> Apk {
    Apk {
        id: "com.tencent.qq",
        app_key: APP_KEY,
        name: "A6.8.2.21241",
        version: "6.8.2.21241",
        ver: "6.8.2",
        sign: HD_SIGN,
        buildtime: 1647227495,
        appid: 16,
        subid: 537128930,
        bitmap: 150470524,
        main_sig_map: 1970400,
        sub_sig_map: 66560,
        sdkver: "6.2.0.1023",
        display: "iMac",
        device_type: 5,
        qua: "",
        ssover: 12,
    }
}

fn ipad() -> Apk {
    Apk {
        subid: 537155074,
        sign: HD_SIGN,
        name: "8.9.50.611",
        version: "8.9.50.611",
        ver: "8.9.50",
        sdkver: "6.0.0.2535",
        qua: "",
        display: "iPad",
        ssover: 19,
        ..mobile(&MOBILE_RELEASES[0], "iPad", MOBILE_RELEASES[0].subid)
    }
}

/// Lists the known application descriptors for a platform, newest first.
pub fn apk_list(platform: Platform) -> Vec<Apk> {
    match platform {
        Platform::Android => MOBILE_RELEASES
            .iter()
            .map(|release| mobile(release, "Android", release.subid))
            .collect(),
        Platform::APad => MOBILE_RELEASES
            .iter()
            .map(|release| mobile(release, "aPad", release.pad_subid))
            .collect(),
        Platform::Tim => TIM_RELEASES.iter().map(tim).collect(),
        Platform::Watch => WATCH_RELEASES.iter().map(watch).collect(),
        Platform::IMac => vec![imac()],
        Platform::IPad => vec![ipad()],
    }
}

/// Selects the descriptor matching `ver`, falling back to the newest one.
pub fn apk_info(platform: Platform, ver: Option<&str>) -> Apk {
    let mut list = apk_list(platform);
    let index = ver
        .and_then(|ver| list.iter().position(|apk| apk.ver == ver))
        .unwrap_or(0);
    list.swap_remove(index)
}

/// Android OS build information reported by the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsVersion {
    pub incremental: String,
    pub release: String,
    pub codename: String,
    pub sdk: u32,
}

/// Pre-built device record presented during login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    pub product: String,
    pub device: String,
    pub board: String,
    pub brand: String,
    pub model: String,
    pub wifi_ssid: String,
    pub wifi_bssid: String,
    pub bootloader: String,
    pub display: String,
    pub boot_id: String,
    pub proc_version: String,
    pub mac_address: String,
    pub ip_address: String,
    pub android_id: String,
    pub fingerprint: String,
    pub baseband: String,
    pub sim: String,
    pub os_type: String,
    pub imei: String,
    pub apn: String,
    pub version: OsVersion,
    #[serde(with = "hex_bytes")]
    pub imsi: Bytes,
    #[serde(with = "hex_bytes")]
    pub guid: Bytes,
    pub qimei16: Option<String>,
    pub qimei36: Option<String>,
}

impl Device {
    /// Fills `guid` as `md5(imei + mac_address)` when it is missing.
    pub fn with_derived_guid(mut self) -> Self {
        if self.guid.is_empty() {
            let seed = format!("{}{}", self.imei, self.mac_address);
            self.guid = Bytes::copy_from_slice(&md5::compute(seed.as_bytes()).0);
        }
        self
    }

    pub fn apply_tracking(&mut self, ids: TrackingIds) {
        if let Some(qimei36) = ids.qimei36.as_deref() {
            if let Ok(raw) = hex::decode(qimei36) {
                self.imsi = Bytes::from(raw);
            }
        }
        self.qimei16 = ids.qimei16;
        self.qimei36 = ids.qimei36;
    }
}

/// Device tracking identifiers issued by the vendor service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingIds {
    pub qimei16: Option<String>,
    pub qimei36: Option<String>,
}

/// Resolves tracking identifiers before a fresh login.
#[async_trait]
pub trait TrackingResolver: Send + Sync {
    async fn resolve(&self, device: &Device, apk: &Apk) -> Result<TrackingIds, DeviceError>;
}

/// Resolver used when no tracking service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTracking;

#[async_trait]
impl TrackingResolver for NoTracking {
    async fn resolve(&self, _device: &Device, _apk: &Apk) -> Result<TrackingIds, DeviceError> {
        Err(DeviceError::Unavailable("no tracking resolver configured".to_owned()))
    }
}

mod hex_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
