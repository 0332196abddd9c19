//! Configuration queries from the PAM module.
//!
//! Only a small subset of options can be requested; unknown option codes
//! produce an empty result rather than an error so older and newer
//! clients interoperate.

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::proto::{config_option, Action};
use crate::result::Result;

use super::RequestCtx;

pub async fn get<S: AsyncRead + AsyncWrite + Unpin>(ctx: &mut RequestCtx<'_, S>) -> Result<()> {
    let option = ctx.stream.read_i32().await?;
    debug!("config_get({})", option);
    ctx.stream.write_response_header(Action::ConfigGet).await?;
    let value = match option {
        config_option::PAM_PASSWORD_PROHIBIT_MESSAGE => ctx
            .cfg
            .pam_password_prohibit_message
            .clone()
            .unwrap_or_default(),
        _ => {
            debug!("config_get({}): unknown option", option);
            return ctx.stream.end_results().await;
        }
    };
    ctx.stream.begin_record().await?;
    ctx.stream.write_string(&value).await?;
    ctx.stream.end_results().await
}
