#![allow(dead_code)]

use httpmock::prelude::*;

use loadforge::prelude::*;

pub const INDEX_PATH: &str = "/";
pub const ABOUT_PATH: &str = "/about.html";
pub const ERROR_PATH: &str = "/error";
pub const SLOW_PATH: &str = "/slow";

pub async fn get_index(session: &HttpSession) -> TaskResult {
    let _response = session.get(INDEX_PATH, "index").await?;
    Ok(())
}

pub async fn get_about(session: &HttpSession) -> TaskResult {
    let _response = session.get(ABOUT_PATH, "about").await?;
    Ok(())
}

pub async fn get_error(session: &HttpSession) -> TaskResult {
    let _response = session.get(ERROR_PATH, "error").await?;
    Ok(())
}

pub async fn get_slow(session: &HttpSession) -> TaskResult {
    let _response = session.get(SLOW_PATH, "slow").await?;
    Ok(())
}

/// Manually specify configuration normally provided as CLI options.
pub fn build_configuration() -> ForgeConfiguration {
    ForgeConfiguration {
        no_print_summary: true,
        quiet: 2,
        ..ForgeConfiguration::default()
    }
}

/// Mock the standard happy-path endpoints on the given server.
pub fn mock_endpoints(server: &MockServer) {
    server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH);
        then.status(200).body("index page");
    });
    server.mock(|when, then| {
        when.method(GET).path(ABOUT_PATH);
        then.status(200).body("about page");
    });
}
