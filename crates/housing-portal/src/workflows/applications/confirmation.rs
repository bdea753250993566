use rand::RngCore;

use super::domain::ConfirmationCode;

/// Source of candidate confirmation codes; uniqueness is checked by the caller.
pub trait ConfirmationCodeGenerator: Send + Sync {
    fn generate(&self) -> ConfirmationCode;
}

/// Four random bytes rendered as eight uppercase hex characters.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomCodeGenerator;

impl ConfirmationCodeGenerator for RandomCodeGenerator {
    fn generate(&self) -> ConfirmationCode {
        let mut bytes = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut bytes);
        ConfirmationCode(hex::encode_upper(bytes))
    }
}
