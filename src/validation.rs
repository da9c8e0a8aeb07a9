//! Input rules shared by the user, forum and research handlers.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::ValidationErrors;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$")
        .expect("email pattern compiles")
});

static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w.@+-]+$").expect("username pattern compiles"));

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\s.,!?()-]+$").expect("title pattern compiles"));

pub const POST_TITLE_MIN: usize = 5;
pub const POST_TITLE_MAX: usize = 200;
pub const CONTENT_MIN: usize = 10;
pub const CONTENT_MAX: usize = 5000;

pub fn is_valid_email(email: &str) -> bool {
    !email.is_empty() && email.len() <= 254 && EMAIL_RE.is_match(email)
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn char_len(value: &str) -> usize {
    value.chars().count()
}

pub fn validate_username(errors: &mut ValidationErrors, username: &str) {
    let trimmed = username.trim();
    if char_len(trimmed) < 3 {
        errors.add("username", "Username must be at least 3 characters long.");
    } else if char_len(trimmed) > 150 {
        errors.add("username", "Username cannot exceed 150 characters.");
    } else if !USERNAME_RE.is_match(trimmed) {
        errors.add(
            "username",
            "Username may contain only letters, numbers, and @/./+/-/_ characters.",
        );
    }
}

/// At least eight characters with upper case, lower case and a digit.
pub fn validate_password(errors: &mut ValidationErrors, field: &str, password: &str) {
    if char_len(password) < 8 {
        errors.add(field, "Password must be at least 8 characters long");
        return;
    }
    if !password.chars().any(char::is_uppercase) {
        errors.add(field, "Password must contain at least one uppercase letter");
    }
    if !password.chars().any(char::is_lowercase) {
        errors.add(field, "Password must contain at least one lowercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        errors.add(field, "Password must contain at least one number");
    }
}

pub fn validate_post_title(errors: &mut ValidationErrors, title: &str) {
    if char_len(title.trim()) < POST_TITLE_MIN {
        errors.add("title", "Title must be at least 5 characters long.");
    } else if char_len(title) > POST_TITLE_MAX {
        errors.add("title", "Title cannot exceed 200 characters.");
    } else if !TITLE_RE.is_match(title) {
        errors.add("title", "Title contains invalid characters.");
    }
}

pub fn validate_content(errors: &mut ValidationErrors, content: &str) {
    if char_len(content.trim()) < CONTENT_MIN {
        errors.add("content", "Content must be at least 10 characters long.");
    } else if char_len(content) > CONTENT_MAX {
        errors.add("content", "Content cannot exceed 5000 characters.");
    }
}

/// The post body may not simply restate its title.
pub fn validate_title_not_repeated(errors: &mut ValidationErrors, title: &str, content: &str) {
    let title = title.trim().to_lowercase();
    if !title.is_empty() && content.to_lowercase().contains(&title) {
        errors.add("non_field_errors", "Title should not be repeated in content");
    }
}

/// Checks that each required key is present and holds a non-blank string.
///
/// Missing keys are reported before blank ones, each naming the field.
pub fn require_fields(errors: &mut ValidationErrors, data: &Value, fields: &[&str]) {
    for field in fields {
        match data.get(*field) {
            None | Some(Value::Null) => errors.add(field, "This field is required."),
            Some(Value::String(value)) if value.trim().is_empty() => {
                errors.add(field, "This field cannot be empty.")
            }
            Some(Value::String(_)) => {}
            Some(_) => errors.add(field, "Expected a string."),
        }
    }
}

pub fn str_field<'a>(data: &'a Value, field: &str) -> &'a str {
    data.get(field).and_then(Value::as_str).unwrap_or_default()
}

/// Guest identity fields attached to anonymous posts and comments.
pub fn validate_guest_fields(errors: &mut ValidationErrors, data: &Value) {
    require_fields(errors, data, &["guest_name", "guest_affiliation"]);

    let name = str_field(data, "guest_name");
    if !errors.has("guest_name") {
        if char_len(name.trim()) < 2 {
            errors.add("guest_name", "Guest name must be at least 2 characters long");
        } else if char_len(name) > 100 {
            errors.add("guest_name", "Guest name cannot exceed 100 characters");
        }
    }

    if !errors.has("guest_affiliation") && char_len(str_field(data, "guest_affiliation")) > 200 {
        errors.add(
            "guest_affiliation",
            "Guest affiliation cannot exceed 200 characters",
        );
    }

    let email = str_field(data, "guest_email").trim();
    if !email.is_empty() && !is_valid_email(email) {
        errors.add("guest_email", "Invalid email format");
    }
}

pub fn validate_contact_fields(errors: &mut ValidationErrors, data: &Value) {
    require_fields(errors, data, &["name", "email", "subject", "message"]);
    if !errors.is_empty() {
        return;
    }

    let email = str_field(data, "email").trim();
    if !is_valid_email(email) {
        errors.add("email", "Invalid email format");
    }

    let name = str_field(data, "name");
    if char_len(name.trim()) < 2 {
        errors.add("name", "Name must be at least 2 characters long");
    } else if char_len(name) > 100 {
        errors.add("name", "Name cannot exceed 100 characters");
    }

    let subject = str_field(data, "subject");
    if char_len(subject.trim()) < 5 {
        errors.add("subject", "Subject must be at least 5 characters long");
    } else if char_len(subject) > 200 {
        errors.add("subject", "Subject cannot exceed 200 characters");
    }

    let message = str_field(data, "message");
    if char_len(message.trim()) < 10 {
        errors.add("message", "Message must be at least 10 characters long");
    } else if char_len(message) > 5000 {
        errors.add("message", "Message cannot exceed 5000 characters");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn email_shapes() {
        assert!(is_valid_email("ada@example.org"));
        assert!(is_valid_email("first.last+tag@sub.example.co.uk"));
        assert!(!is_valid_email("ada@"));
        assert!(!is_valid_email("ada example.org"));
        assert!(!is_valid_email("ada@localhost"));
    }

    #[test]
    fn password_policy_reports_each_missing_class() {
        let mut errors = ValidationErrors::new();
        validate_password(&mut errors, "password", "alllowercase");
        assert_eq!(errors.messages("password").len(), 2);

        let mut errors = ValidationErrors::new();
        validate_password(&mut errors, "password", "Str0ngEnough");
        assert!(errors.is_empty());
    }

    #[test]
    fn short_post_content_is_rejected() {
        let mut errors = ValidationErrors::new();
        validate_content(&mut errors, "short");
        assert_eq!(
            errors.messages("content"),
            ["Content must be at least 10 characters long.".to_string()]
        );
    }

    #[test]
    fn title_charset_is_restricted() {
        let mut errors = ValidationErrors::new();
        validate_post_title(&mut errors, "Soil <script> notes");
        assert!(errors.has("title"));

        let mut errors = ValidationErrors::new();
        validate_post_title(&mut errors, "Soil carbon, revisited (2024)!");
        assert!(errors.is_empty());
    }

    #[test]
    fn guest_fields_missing_and_blank_are_named() {
        let mut errors = ValidationErrors::new();
        validate_guest_fields(&mut errors, &json!({ "guest_affiliation": "  " }));
        assert_eq!(errors.messages("guest_name"), ["This field is required.".to_string()]);
        assert_eq!(
            errors.messages("guest_affiliation"),
            ["This field cannot be empty.".to_string()]
        );
    }

    #[test]
    fn guest_email_is_optional_but_checked() {
        let mut errors = ValidationErrors::new();
        validate_guest_fields(
            &mut errors,
            &json!({ "guest_name": "Ada", "guest_affiliation": "Uni", "guest_email": "nope" }),
        );
        assert!(errors.has("guest_email"));
        assert!(!errors.has("guest_name"));
    }

    #[test]
    fn contact_form_lengths() {
        let mut errors = ValidationErrors::new();
        validate_contact_fields(
            &mut errors,
            &json!({
                "name": "A",
                "email": "a@example.org",
                "subject": "Hi",
                "message": "Too short"
            }),
        );
        assert!(errors.has("name"));
        assert!(errors.has("subject"));
        assert!(errors.has("message"));
        assert!(!errors.has("email"));
    }
}
