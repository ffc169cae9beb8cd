//! `deliverflow slug`: print the tag-safe form of a ref name.

use clap::Args;
use deliverflow::context::ref_slug;

/// Arguments for the `slug` command.
#[derive(Args, Debug)]
pub struct SlugArgs {
    /// Branch or tag name.
    #[arg(env = "CI_COMMIT_REF_NAME")]
    pub ref_name: String,
}

/// Executes the `slug` command.
pub fn execute(args: &SlugArgs) -> i32 {
    println!("{}", ref_slug(&args.ref_name));
    0
}
