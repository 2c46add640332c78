//! Field rules for the sign-up form.

use std::sync::OnceLock;

use chrono::{Local, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const PASSWORD_SPECIALS: &str = "!@#$%^&*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    Email,
    AuthCode,
    Password,
    PasswordConfirm,
    Name,
    Phone,
    Nickname,
    Birthdate,
    Agreement,
}

impl Field {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::AuthCode => "authCode",
            Self::Password => "password",
            Self::PasswordConfirm => "passwordConfirm",
            Self::Name => "name",
            Self::Phone => "phone",
            Self::Nickname => "nickname",
            Self::Birthdate => "birthdate",
            Self::Agreement => "agreement",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("이메일 형식이 올바르지 않습니다.")]
    Email,
    #[error("이메일 인증이 필요합니다.")]
    EmailNotVerified,
    #[error("8~16자리 비밀번호 입력 (영문 + 숫자 + 특수문자 포함)")]
    Password,
    #[error("비밀번호가 일치하지 않습니다.")]
    PasswordMismatch,
    #[error("이름은 한글로 입력해주세요.")]
    Name,
    #[error("휴대전화번호는 숫자 10~11자리입니다.")]
    Phone,
    #[error("휴대전화번호 중복확인이 필요합니다.")]
    PhoneNotChecked,
    #[error("닉네임 형식 오류")]
    Nickname,
    #[error("닉네임 중복확인이 필요합니다.")]
    NicknameNotChecked,
    #[error("생년월일 8자리를 올바르게 입력해주세요.")]
    Birthdate,
    #[error("약관에 동의해주세요.")]
    Agreement,
}

impl ValidationError {
    pub const fn field(self) -> Field {
        match self {
            Self::Email | Self::EmailNotVerified => Field::Email,
            Self::Password => Field::Password,
            Self::PasswordMismatch => Field::PasswordConfirm,
            Self::Name => Field::Name,
            Self::Phone | Self::PhoneNotChecked => Field::Phone,
            Self::Nickname | Self::NicknameNotChecked => Field::Nickname,
            Self::Birthdate => Field::Birthdate,
            Self::Agreement => Field::Agreement,
        }
    }
}

fn cached(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static pattern compiles"))
}

fn email_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    cached(&CELL, r".+@.+\..+")
}

fn password_charset() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    cached(&CELL, r"^[A-Za-z0-9!@#$%^&*]{8,16}$")
}

fn nickname_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    cached(&CELL, r"^[가-힣a-zA-Z0-9]{2,8}$")
}

fn name_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    cached(&CELL, r"^[가-힣]+$")
}

fn phone_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    cached(&CELL, r"^[0-9]{10,11}$")
}

fn birthdate_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    cached(&CELL, r"^([0-9]{4})([0-9]{2})([0-9]{2})$")
}

pub fn is_valid_email(email: &str) -> bool {
    email_pattern().is_match(email)
}

/// 8 to 16 characters from letters, digits and `!@#$%^&*`, with at least
/// one of each class.
pub fn is_valid_password(password: &str) -> bool {
    password_charset().is_match(password)
        && password.chars().any(|c| c.is_ascii_alphabetic())
        && password.chars().any(|c| c.is_ascii_digit())
        && password.chars().any(|c| PASSWORD_SPECIALS.contains(c))
}

pub fn is_valid_nickname(nickname: &str) -> bool {
    nickname_pattern().is_match(nickname) && !nickname.chars().all(|c| c.is_ascii_digit())
}

pub fn is_valid_name(name: &str) -> bool {
    name_pattern().is_match(name)
}

pub fn is_valid_phone(phone: &str) -> bool {
    phone_pattern().is_match(phone)
}

/// Parses `YYYYMMDD`. The date must exist and must not lie after `today`.
pub fn parse_birthdate_on(input: &str, today: NaiveDate) -> Result<NaiveDate, ValidationError> {
    let caps = birthdate_pattern()
        .captures(input)
        .ok_or(ValidationError::Birthdate)?;
    let number = |i: usize| caps[i].parse::<u32>().map_err(|_| ValidationError::Birthdate);
    let year = i32::try_from(number(1)?).map_err(|_| ValidationError::Birthdate)?;
    let date =
        NaiveDate::from_ymd_opt(year, number(2)?, number(3)?).ok_or(ValidationError::Birthdate)?;
    if date > today {
        return Err(ValidationError::Birthdate);
    }
    Ok(date)
}

pub fn parse_birthdate(input: &str) -> Result<NaiveDate, ValidationError> {
    parse_birthdate_on(input, Local::now().date_naive())
}

/// `YYYY-MM-DD`, the form the sign-up endpoint expects.
pub fn format_birthdate(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn email_needs_at_and_dot() {
        assert!(is_valid_email("a@b.co"));
        assert!(is_valid_email("first.last@mail.example.kr"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("ab.co"));
        assert!(!is_valid_email("@b.co"));
    }

    #[test]
    fn password_requires_each_class() {
        assert!(is_valid_password("abcd123!"));
        assert!(is_valid_password("Z9*aaaaaaaaaaaaa"));
        assert!(!is_valid_password("abcdefg!"));
        assert!(!is_valid_password("12345678!"));
        assert!(!is_valid_password("abcd1234"));
        assert!(!is_valid_password("ab1!"));
        assert!(!is_valid_password("abcd1234!abcd1234"));
        assert!(!is_valid_password("abcd 123!"));
    }

    #[test]
    fn nickname_rules() {
        assert!(is_valid_nickname("길동"));
        assert!(is_valid_nickname("gil2"));
        assert!(!is_valid_nickname("1234"));
        assert!(!is_valid_nickname("a"));
        assert!(!is_valid_nickname("123456789"));
        assert!(!is_valid_nickname("gil_dong"));
    }

    #[test]
    fn name_is_hangul_only() {
        assert!(is_valid_name("홍길동"));
        assert!(!is_valid_name("Hong"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("홍 길동"));
    }

    #[test]
    fn phone_is_ten_or_eleven_digits() {
        assert!(is_valid_phone("0212345678"));
        assert!(is_valid_phone("01012345678"));
        assert!(!is_valid_phone("010-1234-5678"));
        assert!(!is_valid_phone("010123456789"));
        assert!(!is_valid_phone("０１０１２３４５６７８"));
    }

    #[test]
    fn birthdate_must_be_real_and_past() {
        let today = day(2024, 6, 1);
        assert_eq!(parse_birthdate_on("19990102", today), Ok(day(1999, 1, 2)));
        assert_eq!(parse_birthdate_on("20240601", today), Ok(today));
        assert!(parse_birthdate_on("20240602", today).is_err());
        assert!(parse_birthdate_on("19990230", today).is_err());
        assert!(parse_birthdate_on("1999-01-02", today).is_err());
        assert!(parse_birthdate_on("1999012", today).is_err());
    }

    #[test]
    fn birthdate_formats_with_dashes() {
        assert_eq!(format_birthdate(day(1999, 1, 2)), "1999-01-02");
    }

    #[test]
    fn error_reports_its_field() {
        assert_eq!(ValidationError::PasswordMismatch.field(), Field::PasswordConfirm);
        assert_eq!(ValidationError::PhoneNotChecked.field().as_str(), "phone");
    }

    proptest! {
        #[test]
        fn all_digit_nicknames_are_rejected(n in "[0-9]{2,8}") {
            prop_assert!(!is_valid_nickname(&n));
        }

        #[test]
        fn well_formed_passwords_are_accepted(
            letters in "[a-zA-Z]{1,5}",
            digits in "[0-9]{1,5}",
            specials in "[!@#$%^&*]{1,5}",
        ) {
            let pw = format!("{letters}{digits}{specials}");
            prop_assume!(pw.len() >= 8);
            prop_assert!(is_valid_password(&pw));
        }

        #[test]
        fn past_dates_round_trip_through_compact_form(days in 0i64..40_000) {
            let today = day(2024, 6, 1);
            let date = today - chrono::Duration::days(days);
            let compact = date.format("%Y%m%d").to_string();
            prop_assert_eq!(parse_birthdate_on(&compact, today), Ok(date));
        }
    }
}
