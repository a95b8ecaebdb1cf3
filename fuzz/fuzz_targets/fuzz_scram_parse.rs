#![no_main]

use cancellable_sql::pg::scram::ScramClient;
use libfuzzer_sys::arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;

#[derive(Debug)]
struct ScramInput {
    username: String,
    password: String,
    server_first: String,
    server_final: String,
}

impl<'a> Arbitrary<'a> for ScramInput {
    fn arbitrary(u: &mut Unstructured<'a>) -> libfuzzer_sys::arbitrary::Result<Self> {
        Ok(Self {
            username: u.arbitrary()?,
            password: u.arbitrary()?,
            server_first: u.arbitrary()?,
            server_final: u.arbitrary()?,
        })
    }
}

fuzz_target!(|input: ScramInput| {
    let client = ScramClient::with_nonce(input.username, input.password, "fuzznonce");
    let _ = client.client_first();

    if let Ok((_, verifier)) = client.client_final(&input.server_first) {
        let _ = verifier.verify(&input.server_final);
    }
});
