// Service layer for the tournament engine
pub mod challonge_service;
pub mod country_zones;
pub mod dispatcher;
pub mod errors;
pub mod locks;
pub mod match_service;
pub mod round_progression_service;
pub mod scheduling_service;
pub mod sync_service;
pub mod tournament_service;


pub use challonge_service::{BracketProvider, BracketProviderError, ChallongeConfig, ChallongeService, ExternalMatch, ExternalMatchState};
pub use dispatcher::{ChannelRef, DispatchError, DispatchEvent, Dispatcher, TracingDispatcher, WebhookDispatcher};
pub use errors::TournamentError;
pub use locks::TournamentLocks;
pub use match_service::{MatchService, ReportOutcome, ScheduledMatch};
pub use round_progression_service::{ProgressionOutcome, RoundProgressionService};
pub use scheduling_service::ScheduleError;
pub use sync_service::{SyncReport, SyncService};
pub use tournament_service::{EndReport, StartReport, TournamentOverview, TournamentService};
