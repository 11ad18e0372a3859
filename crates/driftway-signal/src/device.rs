//! Device naming from the `User-Agent` header

use crate::messages::PeerName;

const UNKNOWN_BROWSER: &str = "Unknown browser";

const COLOURS: &[&str] = &[
    "Amber", "Azure", "Coral", "Crimson", "Golden", "Indigo", "Ivory", "Jade", "Lavender",
    "Lime", "Magenta", "Olive", "Orange", "Scarlet", "Silver", "Teal",
];

const ANIMALS: &[&str] = &[
    "Badger", "Beaver", "Crane", "Falcon", "Fox", "Gecko", "Heron", "Ibex", "Koala", "Lynx",
    "Marmot", "Otter", "Panda", "Puffin", "Raven", "Walrus",
];

/// What could be recognised in a user agent string
#[derive(Debug, Default, PartialEq, Eq)]
struct UserAgent {
    browser: Option<&'static str>,
    os: Option<&'static str>,
    device_type: Option<&'static str>,
    vendor: Option<&'static str>,
}

impl UserAgent {
    fn parse(ua: &str) -> Self {
        let has = |needle: &str| ua.contains(needle);

        // Order matters: most Chromium derivatives also claim Chrome and Safari
        let browser = if has("Edg/") || has("EdgA/") || has("EdgiOS/") {
            Some("Edge")
        } else if has("OPR/") || has("Opera") {
            Some("Opera")
        } else if has("SamsungBrowser/") {
            Some("Samsung Internet")
        } else if has("Firefox/") || has("FxiOS/") {
            Some("Firefox")
        } else if has("CriOS/") || has("Chrome/") || has("Chromium/") {
            Some("Chrome")
        } else if has("Safari/") {
            Some("Safari")
        } else {
            None
        };

        let os = if has("Windows") {
            Some("Windows")
        } else if has("iPhone") || has("iPad") || has("iPod") {
            Some("iOS")
        } else if has("Mac OS X") || has("Macintosh") {
            Some("Mac")
        } else if has("Android") {
            Some("Android")
        } else if has("CrOS") {
            Some("Chrome OS")
        } else if has("Linux") {
            Some("Linux")
        } else {
            None
        };

        let device_type = if has("iPad") || has("Tablet") {
            Some("tablet")
        } else if has("Mobi") || has("iPhone") || has("iPod") {
            Some("mobile")
        } else {
            None
        };

        // Apple devices are named by type or OS instead of vendor
        let vendor = if has("SM-") || has("Samsung") {
            Some("Samsung")
        } else if has("Pixel") {
            Some("Google")
        } else if has("HUAWEI") || has("Huawei") {
            Some("Huawei")
        } else if has("Xiaomi") || has("Redmi") {
            Some("Xiaomi")
        } else {
            None
        };

        Self {
            browser,
            os,
            device_type,
            vendor,
        }
    }

    fn is_recognised(&self) -> bool {
        self.browser.is_some() || self.device().is_some()
    }

    fn device(&self) -> Option<&'static str> {
        self.vendor.or(self.device_type).or(self.os)
    }

    fn label(&self) -> String {
        match (self.browser, self.device()) {
            (Some(browser), Some(device)) => format!("{} on {}", browser, device),
            (Some(browser), None) => browser.to_string(),
            (None, Some(device)) => device.to_string(),
            (None, None) => UNKNOWN_BROWSER.to_string(),
        }
    }
}

/// Derive the names shown for a connection
///
/// The device name describes the browser and device. The display name is the
/// device name when anything was recognised, otherwise a random
/// "<Colour> <Animal>" name.
pub fn peer_name(user_agent: Option<&str>) -> PeerName {
    let ua = UserAgent::parse(user_agent.unwrap_or_default());
    let device_name = ua.label();

    let display_name = if ua.is_recognised() {
        device_name.clone()
    } else {
        random_name()
    };

    PeerName {
        display_name,
        device_name,
    }
}

fn random_name() -> String {
    let mut bytes = [0u8; 2];
    if getrandom::fill(&mut bytes).is_err() {
        return format!("{} {}", COLOURS[0], ANIMALS[0]);
    }

    let colour = COLOURS[bytes[0] as usize % COLOURS.len()];
    let animal = ANIMALS[bytes[1] as usize % ANIMALS.len()];
    format!("{} {}", colour, animal)
}
