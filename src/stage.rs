//! Stage tags reported by the device while it validates a new image.

use std::fmt;

use StageClass::{Failure, Progress, Rollback, Success};
use UpdateStage::*;

/// How a stage affects the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageClass {
    /// Normal pipeline step.
    Progress,
    /// A check failed and the device is rolling back; the final verdict
    /// arrives later as a startup result.
    Rollback,
    Success,
    Failure,
}

/// Which branch of the pipeline the device is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePhase {
    Updating,
    RollingBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateStage {
    UploadInProgress,
    UploadCompleted,
    UploadFailed,
    UploadAborted,
    EvaluatePackage,
    PackageFailed,
    PackageNoUpgrade,
    UnpackRootfs,
    UnpackRootfsFailed,
    UnpackApplication,
    UnpackApplicationFailed,
    Reboot,
    StartupCheck,
    CheckRootfs,
    RootfsFailed,
    EspCheckInterface,
    EspInterfaceFailed,
    EspCheckVersion,
    EspNotAvailable,
    EspUpdateInProgress,
    EspUpdateFailed,
    EspValidateVersion,
    McuCheckInterface,
    McuInterfaceFailed,
    McuCheckVersion,
    McuUpdateInProgress,
    McuUpdateFailed,
    McuValidateVersion,
    StartupCompleted,
    StartupFailed,
    UpdateCompleted,
    UpdateFailed,
    Timeout,
    Idle,
}

/// Static description of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageInfo {
    pub stage: UpdateStage,
    pub tag: &'static str,
    /// Progress shown for non-terminal stages.
    pub percent: u8,
    pub message: &'static str,
    pub class: StageClass,
}

const fn entry(stage: UpdateStage, tag: &'static str, percent: u8, message: &'static str, class: StageClass) -> StageInfo {
    StageInfo { stage, tag, percent, message, class }
}

static STAGES: [StageInfo; 34] = [
    entry(UploadInProgress, "UPLOAD_IN_PROGRESS", 0, "Upload in progress ...", Progress),
    entry(UploadCompleted, "UPLOAD_COMPLETED", 5, "Upload completed ...", Progress),
    entry(UploadFailed, "UPLOAD_FAILED", 0, "Upload of .swu file failed! Please restart the grinder and retry.", Failure),
    entry(UploadAborted, "UPLOAD_ABORTED", 0, "Upload of file aborted by user!", Failure),
    entry(EvaluatePackage, "EVALUATE_PACKAGE", 5, "Evaluate upload package ...", Progress),
    entry(
        PackageFailed,
        "PACKAGE_FAILED",
        5,
        "Uploaded package check failed! Maybe the uploaded file is corrupted or is no valid .swu file.",
        Failure,
    ),
    entry(
        PackageNoUpgrade,
        "PACKAGE_NO_UPGRADE",
        5,
        "Uploaded package is no upgrade related to the current firmware version!",
        Failure,
    ),
    entry(UnpackRootfs, "UNPACK_ROOTFS", 20, "Unpacking image #1 of 2 ...", Progress),
    entry(
        UnpackRootfsFailed,
        "UNPACK_ROOTFS_FAILED",
        20,
        "Validation of image #1 failed! Please retry, if still failed please contact technical support.",
        Failure,
    ),
    entry(UnpackApplication, "UNPACK_APPLICATION", 40, "Unpacking image #2 of 2 ...", Progress),
    entry(
        UnpackApplicationFailed,
        "UNPACK_APPLICATION_FAILED",
        40,
        "Validation of image #2 failed! Please retry, if still failed please contact technical support.",
        Failure,
    ),
    entry(Reboot, "REBOOT", 50, "Waiting for restart of system ...", Progress),
    entry(StartupCheck, "STARTUP_CHECK", 55, "Startup check ...", Progress),
    entry(CheckRootfs, "CHECK_ROOTFS", 60, "Checking image #1 consistency ...", Progress),
    entry(RootfsFailed, "ROOTFS_FAILED", 65, "Consistency check of image #1 failed! Going into rollback ...", Rollback),
    entry(EspCheckInterface, "ESP_CHECK_INTERFACE", 65, "Interface check of WiFi board ...", Progress),
    entry(
        EspInterfaceFailed,
        "ESP_INTERFACE_FAILED",
        70,
        "Interface check of WiFi board failed! Going into rollback ...",
        Rollback,
    ),
    entry(EspCheckVersion, "ESP_CHECK_VERSION", 70, "Check of WiFi board firmware version ...", Progress),
    entry(EspNotAvailable, "ESP_NOT_AVAILABLE", 75, "WiFi board not available! Going into rollback ...", Rollback),
    entry(EspUpdateInProgress, "ESP_UPDATE_IN_PROGRESS", 75, "WiFi board firmware update in progress ...", Progress),
    entry(EspUpdateFailed, "ESP_UPDATE_FAILED", 80, "WiFi board firmware update failed! Going into rollback ...", Rollback),
    entry(EspValidateVersion, "ESP_VALIDATE_VERSION", 80, "Validation of WiFi board firmware version ...", Progress),
    entry(McuCheckInterface, "MCU_CHECK_INTERFACE", 85, "Interface check of MCU board ...", Progress),
    entry(
        McuInterfaceFailed,
        "MCU_INTERFACE_FAILED",
        90,
        "Interface check of MCU board failed! Going into rollback ...",
        Rollback,
    ),
    entry(McuCheckVersion, "MCU_CHECK_VERSION", 90, "Check of MCU board firmware version ...", Progress),
    entry(McuUpdateInProgress, "MCU_UPDATE_IN_PROGRESS", 95, "MCU board firmware update in progress ...", Progress),
    entry(McuUpdateFailed, "MCU_UPDATE_FAILED", 100, "MCU board firmware update failed! Going into rollback ...", Rollback),
    entry(McuValidateVersion, "MCU_VALIDATE_VERSION", 100, "Validation of MCU board firmware version ...", Progress),
    entry(StartupCompleted, "STARTUP_COMPLETED", 100, "Startup successfully finished!", Success),
    entry(StartupFailed, "STARTUP_FAILED", 100, "Startup failed!", Failure),
    entry(UpdateCompleted, "UPDATE_COMPLETED", 100, "Firmware update successfully finished!", Success),
    entry(
        UpdateFailed,
        "UPDATE_FAILED",
        100,
        "Firmware update failed! The previous firmware was restored.",
        Failure,
    ),
    entry(Timeout, "TIMEOUT", 100, "Firmware update failed with timeout!", Failure),
    entry(Idle, "IDLE", 100, "Firmware update successfully finished! (IDLE)", Success),
];

impl UpdateStage {
    pub fn from_tag(tag: &str) -> Option<UpdateStage> {
        STAGES.iter().find(|info| info.tag == tag).map(|info| info.stage)
    }

    pub fn info(self) -> &'static StageInfo {
        // The table holds the variants in declaration order.
        &STAGES[self as usize]
    }

    pub fn tag(self) -> &'static str {
        self.info().tag
    }

    pub fn percent(self) -> u8 {
        self.info().percent
    }

    pub fn message(self) -> &'static str {
        self.info().message
    }

    pub fn class(self) -> StageClass {
        self.info().class
    }

    pub fn phase(self) -> StagePhase {
        match self.class() {
            StageClass::Rollback => StagePhase::RollingBack,
            _ => StagePhase::Updating,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self.class(), StageClass::Success | StageClass::Failure)
    }

    /// Operator-facing text, with the device's reason appended to failures.
    pub fn describe(self, error_reason: Option<&str>) -> String {
        match (self.class(), error_reason) {
            (StageClass::Failure, Some(reason)) if !reason.trim().is_empty() => {
                format!("{} Possible reason: {}", self.message(), reason.trim())
            }
            _ => self.message().to_string(),
        }
    }

    pub fn all() -> impl Iterator<Item = UpdateStage> {
        STAGES.iter().map(|info| info.stage)
    }
}

impl fmt::Display for UpdateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}
