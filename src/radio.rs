//! BlueZ radio countermeasures.
//!
//! Failing sensors often leave the adapter in a bad state (stale
//! connections, a wedged radio). These helpers shell out to `bluetoothctl`
//! to clean up, the same way an operator would.

use std::time::Duration;

use log::{error, info, warn};
use tokio::process::Command;
use tokio::time::sleep;

use crate::error::{Error, Result};

const BLUETOOTHCTL: &str = "/usr/bin/bluetoothctl";
const SUDO: &str = "/usr/bin/sudo";
const SYSTEMCTL: &str = "/usr/bin/systemctl";

/// Time to wait after each radio state change so BlueZ can settle
pub const DEFAULT_RESET_SETTLE: Duration = Duration::from_secs(20);

/// Reset the Bluetooth hardware: power the radio off and back on, then
/// restart the Bluetooth service for good measure. `settle` is the pause
/// after each step.
pub async fn ble_reset(settle: Duration) -> Result<()> {
    let devices = run(&[BLUETOOTHCTL, "devices"]).await?;
    info!("known devices: {devices}");

    warn!("resetting BT radio");

    // Have you tried turning it off and on again?
    let off = run(&[BLUETOOTHCTL, "power", "off"]).await?;
    info!("radio off: {off}");
    sleep(settle).await;

    let on = run(&[BLUETOOTHCTL, "power", "on"]).await?;
    info!("radio on: {on}");
    sleep(settle).await;

    // If all else fails...
    let restart = run(&[SUDO, SYSTEMCTL, "restart", "bluetooth.service"]).await?;
    info!("restarted bluetooth service ({restart})");
    sleep(settle).await;
    Ok(())
}

/// Tell BlueZ to drop its connection to the given device. Best effort: an
/// unsuccessful disconnect is logged, not returned.
pub async fn force_disconnect(mac: &str) {
    error!("forcing disconnect from device {mac}");
    match run(&[BLUETOOTHCTL, "disconnect", mac]).await {
        Ok(output) => info!("{output}"),
        Err(e) => warn!("{e}"),
    }
}

async fn run(argv: &[&str]) -> Result<String> {
    let output = Command::new(argv[0])
        .args(&argv[1..])
        .output()
        .await
        .map_err(|e| Error::Radio(format!("{}: {e}", argv[0])))?;
    let stdout = strip_escapes(&String::from_utf8_lossy(&output.stdout));
    if !output.status.success() {
        return Err(Error::Radio(format!(
            "{} exited with {}: {}",
            argv.join(" "),
            output.status,
            stdout.trim()
        )));
    }
    Ok(stdout.trim().to_string())
}

/// Remove ANSI escape sequences and the readline prompt markers that
/// `bluetoothctl` mixes into its output.
fn strip_escapes(text: &str) -> String {
    let mut cleaned = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\u{1b}' => match chars.peek() {
                // CSI sequence: parameter and intermediate bytes, then one
                // final byte in @..~
                Some('[') => {
                    chars.next();
                    for n in chars.by_ref() {
                        if ('@'..='~').contains(&n) {
                            break;
                        }
                    }
                }
                // Two-character escape
                Some(&n) if ('@'..='_').contains(&n) => {
                    chars.next();
                }
                _ => {}
            },
            '\u{01}' | '\u{02}' => {}
            _ => cleaned.push(c),
        }
    }
    cleaned
}

#[test]
fn test_strip_escapes_colors() {
    let text = "\u{1b}[0;94m[bluetooth]\u{1b}[0m# Changing power off succeeded";
    assert_eq!(
        strip_escapes(text),
        "[bluetooth]# Changing power off succeeded"
    );
}

#[test]
fn test_strip_escapes_prompt_markers() {
    let text = "\u{01}\u{1b}[0;94m\u{02}[bluetooth]\u{01}\u{1b}[0m\u{02}# ok";
    assert_eq!(strip_escapes(text), "[bluetooth]# ok");
}

#[test]
fn test_strip_escapes_plain_text_untouched() {
    assert_eq!(strip_escapes("Device A4:C1:38:01:23:45 LYWSD03MMC"), "Device A4:C1:38:01:23:45 LYWSD03MMC");
}
