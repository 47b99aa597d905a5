//! Vendor analytic-code tables
//!
//! Each driver filters requested analytics against its vendor's known codes.
//! The literal `ALL` or `*` in a descriptor's analytics list expands to the
//! whole table; unknown codes are logged and skipped by the caller.

/// Dahua eventManager codes
pub const DAHUA_EVENT_TYPES: &[&str] = &[
    "VideoMotion",
    "SmartMotionHuman",
    "SmartMotionVehicle",
    "VideoLoss",
    "VideoBlind",
    "AlarmLocal",
    "CrossLineDetection",
    "CrossRegionDetection",
    "LeftDetection",
    "TakenAwayDetection",
    "VideoAbnormalDetection",
    "FaceDetection",
    "AudioMutation",
    "AudioAnomaly",
    "VideoUnFocus",
    "WanderDetection",
    "RioterDetection",
    "ParkingDetection",
    "MoveDetection",
    "StorageNotExist",
    "StorageFailure",
    "StorageLowSpace",
    "AlarmOutput",
    "MDResult",
    "HeatImagingTemper",
    "CrowdDetection",
    "FireWarning",
    "FireWarningInfo",
];

/// Hikvision ISAPI subscribeEvent types
pub const HIKVISION_EVENT_TYPES: &[&str] = &[
    "faceCapture",
    "VMD",
    "linedetection",
    "fielddetection",
    "regionEntrance",
    "regionExiting",
    "loitering",
    "group",
    "rapidMove",
    "parking",
    "unattendedBaggage",
    "attendedBaggage",
    "shelteralarm",
    "scenechangedetection",
    "videoloss",
    "tamperdetection",
    "faceSnap",
    "audioexception",
    "defocus",
];

/// Case-insensitive membership test against a code table
pub fn code_known(table: &[&str], name: &str) -> bool {
    let name = name.trim();
    table.iter().any(|code| code.eq_ignore_ascii_case(name))
}

/// True when the request list asks for every known code
pub fn requests_all(analytics: &[String]) -> bool {
    analytics
        .iter()
        .any(|a| a.trim() == "*" || a.trim().eq_ignore_ascii_case("all"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_known_case_insensitive() {
        assert!(code_known(DAHUA_EVENT_TYPES, "facedetection"));
        assert!(code_known(DAHUA_EVENT_TYPES, "CrossLineDetection"));
        assert!(!code_known(DAHUA_EVENT_TYPES, "faceCapture"));
        assert!(code_known(HIKVISION_EVENT_TYPES, "FACECAPTURE"));
    }

    #[test]
    fn test_requests_all() {
        assert!(requests_all(&["*".to_string()]));
        assert!(requests_all(&["foo".to_string(), "ALL".to_string()]));
        assert!(!requests_all(&["faceCapture".to_string()]));
    }
}
