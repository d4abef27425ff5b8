pub mod password;
pub mod token;

pub use password::{
    hash_password, validate_password, verify_password, Password, PasswordHashString,
    PasswordPolicyError,
};
pub use token::{generate_temp_credential, generate_token, hash_token};
