use axum::{Json, body::Bytes, extract::State};
use tracing::{debug, info};
use uuid::Uuid;

use quill_types::api::{
    SendOtpRequest, SendOtpResponse, UserResponse, VerifyOtpRequest, VerifyOtpResponse,
};
use quill_types::models::SubscriptionTier;

use crate::error::{ApiError, parse_json, required};
use crate::middleware::create_token;
use crate::state::AppState;

const VERIFY_FAILED: &str = "Server error during OTP verification.";

pub async fn send_otp(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SendOtpResponse>, ApiError> {
    let req: SendOtpRequest = parse_json(&body)?;
    let mobile_number =
        required(req.mobile_number).ok_or_else(|| ApiError::validation("Mobile number is required."))?;

    let otp = state.otp.issue(&mobile_number);
    // Delivered in the response body; there is no SMS gateway.
    debug!(mobile_number = %mobile_number, otp = %otp, "OTP issued");

    Ok(Json(SendOtpResponse {
        message: "OTP sent successfully.".into(),
        otp,
    }))
}

pub async fn verify_otp(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<VerifyOtpResponse>, ApiError> {
    let req: VerifyOtpRequest = parse_json(&body)?;
    let (Some(mobile_number), Some(otp)) = (required(req.mobile_number), required(req.otp)) else {
        return Err(ApiError::validation("Mobile number and OTP are required."));
    };

    if !state.otp.verify(&mobile_number, &otp) {
        return Err(ApiError::unauthorized("Invalid or expired OTP."));
    }

    let number = mobile_number.clone();
    let user = state
        .with_db(VERIFY_FAILED, move |db| db.find_or_create_user_by_mobile(&number))
        .await?;

    let user_id: Uuid = user.id.parse().map_err(ApiError::internal(VERIFY_FAILED))?;
    let subscription_tier: SubscriptionTier = user
        .subscription_tier
        .parse()
        .map_err(anyhow::Error::msg)
        .map_err(ApiError::internal(VERIFY_FAILED))?;

    let token = create_token(&state.jwt_secret, user_id, &user.mobile_number)
        .map_err(ApiError::internal(VERIFY_FAILED))?;

    info!(user_id = %user_id, "User logged in");

    Ok(Json(VerifyOtpResponse {
        message: "Login successful!".into(),
        token,
        user: UserResponse {
            id: user_id,
            mobile_number: user.mobile_number,
            subscription_tier,
        },
    }))
}
