//! Command parsing and execution.

use anyhow::{anyhow, Result};
use tracing::warn;

use classdesk_core::{App, Resolution, Role};

/// Environment variable consulted before prompting for a password
const PASSWORD_ENV: &str = "CLASSDESK_PASSWORD";

pub const USAGE: &str = "\
Usage: classdesk <command>

Commands:
  login [--role student|teacher] <email>   Log in (password is prompted)
  signup <username> <email> <role>         Create an account
  logout                                   Log out and forget the session
  whoami                                   Show the current session
  refresh                                  Exchange the refresh cookie for a new token
  forgot-password <email>                  Mail a one-time password
  verify-otp <email> <otp>                 Check a one-time password
  reset-password <email>                   Set a new password
  google-login [return_to]                 Start a Google login
  google-resume <state> <query>            Finish a Google login from its callback
  route <path>                             Show where navigating to <path> leads
  get <path>                               Authenticated GET, prints the JSON body";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login { email: Option<String>, role: Option<Role> },
    SignUp { username: String, email: String, role: Role },
    Logout,
    WhoAmI,
    Refresh,
    ForgotPassword { email: String },
    VerifyOtp { email: String, otp: String },
    ResetPassword { email: String },
    GoogleLogin { return_to: String },
    GoogleResume { state: String, query: String },
    Route { path: String },
    Get { path: String },
}

impl Command {
    pub fn parse(args: &[String]) -> Option<Self> {
        let (name, rest) = args.split_first()?;
        let rest: Vec<&str> = rest.iter().map(String::as_str).collect();

        let command = match (name.as_str(), rest.as_slice()) {
            ("login", rest) => {
                let mut role = None;
                let mut email = None;
                let mut iter = rest.iter();
                while let Some(arg) = iter.next() {
                    if *arg == "--role" {
                        role = Some(iter.next()?.parse().ok()?);
                    } else if email.is_none() {
                        email = Some(arg.to_string());
                    } else {
                        return None;
                    }
                }
                Command::Login { email, role }
            }
            ("signup", [username, email, role]) => Command::SignUp {
                username: username.to_string(),
                email: email.to_string(),
                role: role.parse().ok()?,
            },
            ("logout", []) => Command::Logout,
            ("whoami", []) => Command::WhoAmI,
            ("refresh", []) => Command::Refresh,
            ("forgot-password", [email]) => Command::ForgotPassword { email: email.to_string() },
            ("verify-otp", [email, otp]) => Command::VerifyOtp {
                email: email.to_string(),
                otp: otp.to_string(),
            },
            ("reset-password", [email]) => Command::ResetPassword { email: email.to_string() },
            ("google-login", []) => Command::GoogleLogin { return_to: Role::Student.home_route().to_string() },
            ("google-login", [return_to]) => Command::GoogleLogin { return_to: return_to.to_string() },
            ("google-resume", [state, query]) => Command::GoogleResume {
                state: state.to_string(),
                query: query.to_string(),
            },
            ("route", [path]) => Command::Route { path: path.to_string() },
            ("get", [path]) => Command::Get { path: path.to_string() },
            _ => return None,
        };
        Some(command)
    }
}

pub async fn run(app: &mut App, command: Command) -> Result<()> {
    match command {
        Command::Login { email, role } => login(app, email, role).await,
        Command::SignUp { username, email, role } => {
            let password = rpassword::prompt_password("Password: ")?;
            let confirm = rpassword::prompt_password("Confirm password: ")?;
            if password != confirm {
                return Err(anyhow!("Passwords do not match"));
            }
            let summary = app.gateway().sign_up(&username, &email, &password, role).await?;
            println!(
                "{}",
                summary.message.as_deref().unwrap_or("Account created")
            );
            println!("An administrator must approve the account before you can log in.");
            Ok(())
        }
        Command::Logout => {
            app.gateway().logout().await;
            println!("Logged out");
            Ok(())
        }
        Command::WhoAmI => {
            match app.store().current() {
                Some(session) => {
                    println!("{} ({})", session.display_name, session.role);
                    if let Some(subject) = session.claims.subject() {
                        println!("subject: {}", subject);
                    }
                    if let Some(expires) = session.claims.expires_at() {
                        let state = if session.claims.is_expired() { "expired" } else { "expires" };
                        println!("token {}: {}", state, expires.format("%Y-%m-%d %H:%M:%S UTC"));
                    }
                }
                None => println!("Not logged in"),
            }
            Ok(())
        }
        Command::Refresh => {
            let session = app.gateway().refresh().await?;
            println!("Token refreshed for {}", session.display_name);
            Ok(())
        }
        Command::ForgotPassword { email } => {
            println!("{}", app.gateway().request_password_reset(&email).await?);
            Ok(())
        }
        Command::VerifyOtp { email, otp } => {
            println!("{}", app.gateway().verify_otp(&email, &otp).await?);
            Ok(())
        }
        Command::ResetPassword { email } => {
            let password = rpassword::prompt_password("New password: ")?;
            let confirm = rpassword::prompt_password("Confirm password: ")?;
            println!("{}", app.gateway().reset_password(&email, &password, &confirm).await?);
            Ok(())
        }
        Command::GoogleLogin { return_to } => {
            let started = app.gateway().begin_external_login(&return_to)?;
            println!("Open this URL in your browser to continue:");
            println!("{}", started.authorize_url);
            println!();
            println!("Then run: classdesk google-resume {} '<callback query>'", started.state);
            Ok(())
        }
        Command::GoogleResume { state, query } => {
            let (session, return_to) = app.gateway().resume_external_login(&state, &query).await?;
            println!("Logged in as {} ({})", session.display_name, session.role);
            print_resolution(&return_to, app.navigate(&return_to));
            Ok(())
        }
        Command::Route { path } => {
            print_resolution(&path, app.navigate(&path));
            Ok(())
        }
        Command::Get { path } => {
            let body: serde_json::Value = app.api().get_json(&path).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
    }
}

async fn login(app: &mut App, email: Option<String>, role: Option<Role>) -> Result<()> {
    let email = email
        .or_else(|| app.config.last_email.clone())
        .ok_or_else(|| anyhow!("Email required: classdesk login <email>"))?;
    let role = role.or(app.config.last_role).unwrap_or(Role::Student);

    let password = match std::env::var(PASSWORD_ENV) {
        Ok(password) if !password.is_empty() => password,
        _ => rpassword::prompt_password(format!("Password for {}: ", email))?,
    };

    let session = app.gateway().login(&email, &password, role).await?;

    app.config.last_email = Some(email);
    app.config.last_role = Some(session.role);
    if let Err(e) = app.config.save() {
        warn!(error = %e, "Failed to save config");
    }

    println!("Logged in as {} ({})", session.display_name, session.role);
    println!("Home: {}", session.role.home_route());
    Ok(())
}

fn print_resolution(path: &str, resolution: Resolution) {
    match resolution {
        Resolution::Loading => println!("{}: loading", path),
        Resolution::Redirect(to) => println!("{}: redirect to {}", path, to),
        Resolution::Render(page) => println!("{}: render {:?}", path, page),
        Resolution::NotFound => println!("{}: not found", path),
    }
}
