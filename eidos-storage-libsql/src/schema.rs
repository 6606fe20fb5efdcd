//! Database schema definitions for the canonical store and evidence store.

/// SQL to create the episodes table
pub const CREATE_EPISODES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS episodes (
    episode_id TEXT PRIMARY KEY NOT NULL,
    goal TEXT NOT NULL,
    success_criteria TEXT NOT NULL DEFAULT '',
    constraints TEXT NOT NULL DEFAULT '[]',
    budget_max_steps INTEGER NOT NULL DEFAULT 25,
    budget_max_time_seconds INTEGER NOT NULL DEFAULT 720,
    budget_max_retries INTEGER NOT NULL DEFAULT 2,
    budget_max_file_touches INTEGER NOT NULL DEFAULT 3,
    budget_no_evidence_limit INTEGER NOT NULL DEFAULT 5,
    phase TEXT NOT NULL DEFAULT 'explore',
    outcome TEXT NOT NULL DEFAULT 'in_progress',
    final_evaluation TEXT NOT NULL DEFAULT '',
    start_ts REAL NOT NULL,
    end_ts REAL,
    step_count INTEGER NOT NULL DEFAULT 0,
    error_counts TEXT NOT NULL DEFAULT '{}',
    file_touch_counts TEXT NOT NULL DEFAULT '{}',
    no_evidence_streak INTEGER NOT NULL DEFAULT 0,
    confidence_history TEXT NOT NULL DEFAULT '[]',
    stuck_count INTEGER NOT NULL DEFAULT 0,
    escape_protocol_triggered INTEGER NOT NULL DEFAULT 0
)
"#;

/// SQL to create the steps table (the core intelligence unit)
pub const CREATE_STEPS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS steps (
    step_id TEXT PRIMARY KEY NOT NULL,
    episode_id TEXT NOT NULL REFERENCES episodes(episode_id),
    trace_id TEXT,

    intent TEXT NOT NULL,
    decision TEXT NOT NULL DEFAULT '',
    hypothesis TEXT NOT NULL DEFAULT '',
    alternatives TEXT NOT NULL DEFAULT '[]',
    assumptions TEXT NOT NULL DEFAULT '[]',
    prediction TEXT NOT NULL DEFAULT '',
    stop_condition TEXT NOT NULL DEFAULT '',
    confidence_before REAL NOT NULL DEFAULT 0.5,
    budget_snapshot TEXT NOT NULL DEFAULT '{}',

    action_kind TEXT NOT NULL DEFAULT 'reasoning',
    action_details TEXT NOT NULL DEFAULT '{}',

    result TEXT NOT NULL DEFAULT '',
    validation_evidence TEXT NOT NULL DEFAULT '',
    evaluation TEXT NOT NULL DEFAULT 'unknown',
    surprise_level REAL NOT NULL DEFAULT 0.0,
    lesson TEXT NOT NULL DEFAULT '',
    confidence_after REAL NOT NULL DEFAULT 0.5,
    confidence_delta REAL NOT NULL DEFAULT 0.0,

    retrieved_memories TEXT NOT NULL DEFAULT '[]',
    memory_cited INTEGER NOT NULL DEFAULT 0,
    memory_useful INTEGER,
    memory_absent_declared INTEGER NOT NULL DEFAULT 0,

    validated INTEGER NOT NULL DEFAULT 0,
    validation_method TEXT NOT NULL DEFAULT '',
    is_valid INTEGER NOT NULL DEFAULT 1,

    evidence_gathered INTEGER NOT NULL DEFAULT 0,
    progress_made INTEGER NOT NULL DEFAULT 0,

    created_at REAL NOT NULL
)
"#;

/// SQL to create the distillations table (where intelligence lives)
pub const CREATE_DISTILLATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS distillations (
    distillation_id TEXT PRIMARY KEY NOT NULL,
    kind TEXT NOT NULL,
    statement TEXT NOT NULL,
    normalized_statement TEXT NOT NULL,
    refined_statement TEXT NOT NULL DEFAULT '',
    domains TEXT NOT NULL DEFAULT '[]',
    triggers TEXT NOT NULL DEFAULT '[]',
    anti_triggers TEXT NOT NULL DEFAULT '[]',

    source_steps TEXT NOT NULL DEFAULT '[]',
    validation_count INTEGER NOT NULL DEFAULT 0,
    contradiction_count INTEGER NOT NULL DEFAULT 0,
    confidence REAL NOT NULL DEFAULT 0.5,

    times_retrieved INTEGER NOT NULL DEFAULT 0,
    times_used INTEGER NOT NULL DEFAULT 0,
    times_helped INTEGER NOT NULL DEFAULT 0,

    created_at REAL NOT NULL,
    revalidate_by REAL,
    advisory_quality TEXT NOT NULL DEFAULT '{}'
)
"#;

/// SQL to create the distillations archive table
pub const CREATE_DISTILLATIONS_ARCHIVE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS distillations_archive (
    distillation_id TEXT PRIMARY KEY NOT NULL,
    kind TEXT NOT NULL,
    statement TEXT NOT NULL,
    normalized_statement TEXT NOT NULL,
    refined_statement TEXT NOT NULL DEFAULT '',
    domains TEXT NOT NULL DEFAULT '[]',
    triggers TEXT NOT NULL DEFAULT '[]',
    anti_triggers TEXT NOT NULL DEFAULT '[]',
    source_steps TEXT NOT NULL DEFAULT '[]',
    validation_count INTEGER NOT NULL DEFAULT 0,
    contradiction_count INTEGER NOT NULL DEFAULT 0,
    confidence REAL NOT NULL DEFAULT 0.5,
    times_retrieved INTEGER NOT NULL DEFAULT 0,
    times_used INTEGER NOT NULL DEFAULT 0,
    times_helped INTEGER NOT NULL DEFAULT 0,
    created_at REAL NOT NULL,
    revalidate_by REAL,
    advisory_quality TEXT NOT NULL DEFAULT '{}',
    archive_reason TEXT NOT NULL,
    archived_at REAL NOT NULL
)
"#;

/// SQL to create the policies table
pub const CREATE_POLICIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS policies (
    policy_id TEXT PRIMARY KEY NOT NULL,
    statement TEXT NOT NULL,
    scope TEXT NOT NULL DEFAULT 'GLOBAL',
    priority INTEGER NOT NULL DEFAULT 50,
    source TEXT NOT NULL DEFAULT 'INFERRED',
    created_at REAL NOT NULL
)
"#;

/// Indexes for efficient retrieval
pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_steps_episode ON steps(episode_id)",
    "CREATE INDEX IF NOT EXISTS idx_steps_created ON steps(created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_steps_trace ON steps(trace_id)",
    "CREATE INDEX IF NOT EXISTS idx_episodes_start ON episodes(start_ts DESC)",
    "CREATE INDEX IF NOT EXISTS idx_distillations_kind ON distillations(kind)",
    "CREATE INDEX IF NOT EXISTS idx_distillations_confidence ON distillations(confidence DESC)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_distillations_normalized ON distillations(normalized_statement)",
    "CREATE INDEX IF NOT EXISTS idx_policies_scope ON policies(scope)",
    "CREATE INDEX IF NOT EXISTS idx_policies_priority ON policies(priority DESC)",
];

/// SQL to create the evidence table (separate database file)
pub const CREATE_EVIDENCE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS evidence (
    evidence_id TEXT PRIMARY KEY NOT NULL,
    step_id TEXT NOT NULL,

    kind TEXT NOT NULL,
    tool_name TEXT NOT NULL DEFAULT '',

    content TEXT NOT NULL DEFAULT '',
    content_hash TEXT NOT NULL DEFAULT '',
    byte_size INTEGER NOT NULL DEFAULT 0,
    compressed INTEGER NOT NULL DEFAULT 0,

    exit_code INTEGER,
    duration_ms INTEGER,

    created_at REAL NOT NULL,
    expires_at REAL,
    retention_reason TEXT NOT NULL DEFAULT ''
)
"#;

/// Evidence indexes
pub const CREATE_EVIDENCE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_evidence_step ON evidence(step_id)",
    "CREATE INDEX IF NOT EXISTS idx_evidence_expires ON evidence(expires_at) WHERE expires_at IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_evidence_kind ON evidence(kind)",
    "CREATE INDEX IF NOT EXISTS idx_evidence_hash ON evidence(content_hash)",
];
