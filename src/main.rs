// SPDX-FileCopyrightText: AirVoice contributors
//
// SPDX-License-Identifier: GPL-2.0-or-later

use anyhow::Result;

mod audio;
mod controller;
mod messages;
mod mm;
mod modem;
mod pipe;
mod settings;
mod sip;
mod util;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let controller = controller::Controller::prepare().await?;
    controller.run().await?;

    log::info!("AirVoice exiting, bye!");

    Ok(())
}
