//! IP proof: the approver stores the origin it observed and the client has to
//! present the same IP back.

use super::ApprovalError;
use arbor_types::{ips_equal, is_valid_ip, normalize_ip};
use std::net::IpAddr;

pub fn create_info(client_ip: IpAddr) -> (String, String) {
    let ip = normalize_ip(client_ip).to_string();
    (ip.clone(), ip)
}

/// Client info must be empty for this scheme.
pub fn validate_client_info(info: &serde_json::Value) -> Result<(), ApprovalError> {
    if info.is_null() {
        return Ok(());
    }
    Err(ApprovalError::InvalidInfo(
        "client approval takes no info".to_string(),
    ))
}

pub fn create_question(client_ip: IpAddr) -> String {
    normalize_ip(client_ip).to_string()
}

pub fn check_answer(answer: &str, stored: &str) -> bool {
    ips_equal(answer, stored)
}

pub fn validate_client_answer(answer: &str) -> Result<(), ApprovalError> {
    if !is_valid_ip(answer) {
        return Err(ApprovalError::InvalidAnswer(format!("`{answer}` is not an ip")));
    }
    Ok(())
}

pub fn validate_approver_info(info: &str) -> Result<(), ApprovalError> {
    if !is_valid_ip(info) {
        return Err(ApprovalError::InvalidInfo(format!("`{info}` is not an ip")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn info_and_answer_are_the_client_ip() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(create_info(ip), ("127.0.0.1".to_string(), "127.0.0.1".to_string()));
        assert_eq!(create_question(ip), "127.0.0.1");

        let mapped: IpAddr = "::ffff:127.0.0.1".parse().unwrap();
        assert_eq!(create_info(mapped).0, "127.0.0.1");
    }

    #[test]
    fn answer_must_match_observed_ip() {
        assert!(!check_answer("127.0.0.1", "1.1.1.1"));
        assert!(check_answer("127.0.0.1", "127.0.0.1"));
        assert!(check_answer("::ffff:127.0.0.1", "127.0.0.1"));
    }

    #[test]
    fn schemas() {
        assert!(validate_client_info(&json!({})).is_err());
        assert!(validate_client_info(&json!(null)).is_ok());
        assert!(validate_client_answer("wrong").is_err());
        assert!(validate_client_answer("1.1.1.1").is_ok());
        assert!(validate_approver_info("wrong").is_err());
        assert!(validate_approver_info("1.1.1.1").is_ok());
    }
}
