//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common test utilities

use std::env;
use std::time::Duration;

use ringline::core::call_manager::CallManager;
use ringline::core::platform::CallUiAdapter;
use ringline::sim::sim_platform::{SimCallUi, SimPlatform};

macro_rules! error_line {
    () => {
        concat!(module_path!(), ":", line!())
    };
}

pub fn test_init() {
    let log_level = if env::var("DEBUG_TESTS").is_ok() {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Error
    };
    let _ = env_logger::builder()
        .filter_level(log_level)
        .is_test(true)
        .try_init();
}

pub struct TestContext {
    cm: CallManager<SimPlatform>,
    platform: SimPlatform,
    ui: SimCallUi,
}

impl Drop for TestContext {
    fn drop(&mut self) {
        info!("test: closing call manager");
        let _ = self.cm.close();
    }
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_connect_timeout(Duration::from_secs(60))
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        let platform = SimPlatform::new();
        let ui = SimCallUi::new();
        let cm = CallManager::with_connect_timeout(
            platform.clone(),
            CallUiAdapter::new(Box::new(ui.clone())),
            connect_timeout,
        )
        .expect(error_line!());

        Self { cm, platform, ui }
    }

    pub fn cm(&self) -> CallManager<SimPlatform> {
        self.cm.clone()
    }

    pub fn platform(&self) -> &SimPlatform {
        &self.platform
    }

    pub fn ui(&self) -> &SimCallUi {
        &self.ui
    }
}
